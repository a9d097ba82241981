// ABOUTME: FIFO of pending persistence commands shared between change listeners and the committer.
// ABOUTME: take() swaps the queue out atomically; failed batches are put back at the front.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::command::DbCommand;

/// Cloneable handle to the pending-command queue.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    inner: Arc<Mutex<Vec<DbCommand>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking listener must not wedge persistence for good.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<DbCommand>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, command: DbCommand) {
        self.lock().push(command);
    }

    /// Take every pending command, leaving the queue empty.
    pub fn take(&self) -> Vec<DbCommand> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch back ahead of anything queued since it was taken.
    pub fn requeue_front(&self, batch: Vec<DbCommand>) {
        restore_front(&mut self.lock(), batch);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the pending commands in enqueue order.
    pub fn snapshot(&self) -> Vec<DbCommand> {
        self.lock().clone()
    }
}

/// Prepend `batch` to an already locked queue.
pub(crate) fn restore_front(pending: &mut Vec<DbCommand>, mut batch: Vec<DbCommand>) {
    if batch.is_empty() {
        return;
    }
    batch.append(pending);
    *pending = batch;
}
