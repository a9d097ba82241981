// ABOUTME: Background flush worker applying batches of queued commands in one SQLite transaction each.
// ABOUTME: Batches are written strictly in submission order; a failed batch and everything behind it go back to the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::codec::CodecError;
use crate::command::{CommandError, DbCommand};
use crate::queue::{CommandQueue, restore_front};

/// Errors that can occur while flushing a batch to disk.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("flush worker is no longer running")]
    WorkerGone,

    #[error("an earlier batch failed to commit, this one was requeued behind it")]
    Deferred,

    #[error("flush task failed: {0}")]
    Join(String),
}

impl From<CommandError> for WriterError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Sqlite(e) => WriterError::Sqlite(e),
            CommandError::Codec(e) => WriterError::Codec(e),
        }
    }
}

/// Where and how the worker opens the database.
#[derive(Debug, Clone)]
pub struct StoreTarget {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreTarget {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    /// Open a read-write connection, creating the file when missing.
    pub fn open(&self) -> Result<Connection, rusqlite::Error> {
        open_connection(&self.path, self.busy_timeout)
    }
}

pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

type FlushResult = Result<usize, WriterError>;

struct FlushRequest {
    batch: Vec<DbCommand>,
    reply: oneshot::Sender<FlushResult>,
}

/// Handle to the outcome of one `commit`. Dropping it does not cancel the write.
#[derive(Debug)]
#[must_use = "dropping a ticket is fire-and-forget; call wait() to observe the result"]
pub struct CommitTicket {
    state: TicketState,
}

#[derive(Debug)]
enum TicketState {
    Idle,
    Pending(oneshot::Receiver<FlushResult>),
    Failed(WriterError),
}

impl CommitTicket {
    fn idle() -> Self {
        Self {
            state: TicketState::Idle,
        }
    }

    /// True when the commit had nothing to write.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, TicketState::Idle)
    }

    /// Wait for the batch to land. Returns the number of commands written.
    pub async fn wait(self) -> FlushResult {
        match self.state {
            TicketState::Idle => Ok(0),
            TicketState::Pending(rx) => rx.await.map_err(|_| WriterError::WorkerGone)?,
            TicketState::Failed(err) => Err(err),
        }
    }
}

/// Owns the flush worker task and submits batches to it.
pub struct FlushWriter {
    requests: mpsc::UnboundedSender<FlushRequest>,
    permit: Arc<Semaphore>,
    queue: CommandQueue,
    handle: Handle,
}

impl FlushWriter {
    /// Spawn the worker on `handle`. Batches are taken from `queue`.
    pub fn spawn(target: StoreTarget, queue: CommandQueue, handle: Handle) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let permit = Arc::new(Semaphore::new(1));

        let worker = FlushWorker {
            rx,
            permit: Arc::clone(&permit),
            queue: queue.clone(),
            target: Arc::new(target),
        };
        handle.spawn(worker.run());

        Self {
            requests,
            permit,
            queue,
            handle,
        }
    }

    /// Swap out the pending queue and hand it to the worker. Never blocks.
    pub fn commit(&self) -> CommitTicket {
        if self.queue.is_empty() {
            return CommitTicket::idle();
        }
        self.submit()
    }

    // Take and send under the queue lock so the worker's requeue after a
    // failure cannot interleave with a newer batch.
    fn submit(&self) -> CommitTicket {
        let mut pending = self.queue.lock();
        let batch = std::mem::take(&mut *pending);
        let (reply, rx) = oneshot::channel();
        match self.requests.send(FlushRequest { batch, reply }) {
            Ok(()) => CommitTicket {
                state: TicketState::Pending(rx),
            },
            Err(mpsc::error::SendError(request)) => {
                restore_front(&mut pending, request.batch);
                CommitTicket {
                    state: TicketState::Failed(WriterError::WorkerGone),
                }
            }
        }
    }

    /// Flush everything pending and wait until the worker is idle. Commands a
    /// failed flush put back are tried once more; that second failure is
    /// returned.
    pub async fn shutdown(&self) -> FlushResult {
        // Sent even when empty so it lands behind every earlier batch.
        let first = self.submit().wait().await;
        drop(
            self.permit
                .acquire()
                .await
                .map_err(|_| WriterError::WorkerGone)?,
        );

        if self.queue.is_empty() {
            return first;
        }

        let written = first.as_ref().map_or(0, |n| *n);
        if let Err(err) = &first {
            tracing::warn!(error = %err, pending = self.queue.len(), "retrying failed flush during shutdown");
        }
        let retried = self.submit().wait().await?;
        Ok(written + retried)
    }

    /// Blocking form of `shutdown` for non-async callers. Must not be called
    /// from inside an async task, and needs a multi-threaded runtime.
    pub fn shutdown_blocking(&self) -> FlushResult {
        self.handle.block_on(self.shutdown())
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

struct FlushWorker {
    rx: mpsc::UnboundedReceiver<FlushRequest>,
    permit: Arc<Semaphore>,
    queue: CommandQueue,
    target: Arc<StoreTarget>,
}

impl FlushWorker {
    async fn run(mut self) {
        while let Some(FlushRequest { batch, reply }) = self.rx.recv().await {
            let result = self.flush(batch).await;
            // The caller may have dropped their ticket
            let _ = reply.send(result);
        }
        tracing::debug!("flush worker stopped");
    }

    async fn flush(&mut self, batch: Vec<DbCommand>) -> FlushResult {
        if batch.is_empty() {
            return Ok(0);
        }

        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| WriterError::WorkerGone)?;

        let started = Instant::now();
        let target = Arc::clone(&self.target);
        let attempt = batch.clone();
        let outcome = tokio::task::spawn_blocking(move || write_batch(&target, &attempt))
            .await
            .unwrap_or_else(|join| Err(WriterError::Join(join.to_string())));

        match outcome {
            Ok(written) => {
                tracing::debug!(written, elapsed = ?started.elapsed(), "committed batch");
                Ok(written)
            }
            Err(err) => {
                let commands = batch.len();
                let deferred = hold_back(&mut self.rx, &self.queue, batch);
                tracing::error!(
                    error = %err,
                    commands,
                    deferred,
                    "failed to commit batch, requeued"
                );
                Err(err)
            }
        }
    }
}

/// Put a failed batch back at the front of the queue, followed by every batch
/// already submitted behind it. Returns how many later batches were pulled back.
fn hold_back(
    rx: &mut mpsc::UnboundedReceiver<FlushRequest>,
    queue: &CommandQueue,
    failed: Vec<DbCommand>,
) -> usize {
    // Submitters send while holding this lock, so the channel cannot grow
    // while it is drained.
    let mut pending = queue.lock();
    let mut held = failed;
    let mut deferred = 0;
    while let Ok(FlushRequest { batch, reply }) = rx.try_recv() {
        held.extend(batch);
        deferred += 1;
        let _ = reply.send(Err(WriterError::Deferred));
    }
    restore_front(&mut pending, held);
    deferred
}

/// Apply a batch in one transaction. Nothing is visible unless every command succeeds.
pub fn write_batch(target: &StoreTarget, batch: &[DbCommand]) -> FlushResult {
    let mut conn = target.open()?;
    let tx = conn.transaction()?;
    for (index, command) in batch.iter().enumerate() {
        if let Err(err) = command.apply(&tx) {
            tracing::debug!(index, command = command.label(), "command failed");
            return Err(err.into());
        }
    }
    tx.commit()?;
    Ok(batch.len())
}
