// ABOUTME: Observable in-memory entity cache keyed by a natural key, emitting Added/Updated/Removed changes.
// ABOUTME: Changes go synchronously to one persistence listener and to any number of broadcast subscribers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of each cache's broadcast channel.
const CACHE_CHANNEL_CAPACITY: usize = 64;

/// A record with a natural key.
pub trait Keyed {
    type Key: Eq + Hash + Clone + Debug;

    fn key(&self) -> Self::Key;
}

/// Errors raised by strict cache operations.
#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("a record with key {0} already exists")]
    DuplicateKey(String),

    #[error("record key changed during modification: {before} -> {after}")]
    KeyChanged { before: String, after: String },
}

/// A single diff emitted by a cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<R> {
    Added(R),
    Updated(R),
    Removed(R),
}

impl<R> Change<R> {
    pub fn record(&self) -> &R {
        match self {
            Change::Added(r) | Change::Updated(r) | Change::Removed(r) => r,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Added(_) => ChangeKind::Added,
            Change::Updated(_) => ChangeKind::Updated,
            Change::Removed(_) => ChangeKind::Removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Callback invoked synchronously for every change, in mutation order.
pub type ChangeListener<R> = Box<dyn Fn(&Change<R>) + Send + Sync>;

/// An in-memory set of records indexed by key.
pub struct ObservableCache<R: Keyed> {
    records: HashMap<R::Key, R>,
    listener: Option<ChangeListener<R>>,
    changes: broadcast::Sender<Change<R>>,
}

impl<R> Default for ObservableCache<R>
where
    R: Keyed + Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ObservableCache<R>
where
    R: Keyed + Clone + PartialEq,
{
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CACHE_CHANNEL_CAPACITY);
        Self {
            records: HashMap::new(),
            listener: None,
            changes,
        }
    }

    pub fn set_listener(&mut self, listener: ChangeListener<R>) {
        self.listener = Some(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change<R>> {
        self.changes.subscribe()
    }

    /// Bulk load without emitting changes. Later records replace earlier
    /// ones with the same key.
    pub fn hydrate(&mut self, records: impl IntoIterator<Item = R>) {
        for record in records {
            self.records.insert(record.key(), record);
        }
    }

    /// Insert a new record or replace the one with the same key.
    pub fn add_or_update(&mut self, record: R) -> ChangeKind {
        let change = match self.records.entry(record.key()) {
            Entry::Occupied(mut slot) => {
                slot.insert(record.clone());
                Change::Updated(record)
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Change::Added(record)
            }
        };
        let kind = change.kind();
        self.emit(change);
        kind
    }

    /// Insert a record whose key must not exist yet. Fails before touching
    /// any state when it does.
    pub fn add(&mut self, record: R) -> Result<(), CacheError> {
        let key = record.key();
        if self.records.contains_key(&key) {
            return Err(CacheError::DuplicateKey(format!("{:?}", key)));
        }
        self.records.insert(key, record.clone());
        self.emit(Change::Added(record));
        Ok(())
    }

    /// Remove the record with `key`. No-op when absent.
    pub fn remove(&mut self, key: &R::Key) -> Option<R> {
        let removed = self.records.remove(key)?;
        self.emit(Change::Removed(removed.clone()));
        Some(removed)
    }

    /// Mutate a resident record in place. Emits `Updated` only when the
    /// record actually changed. Returns `Ok(None)` when the key is absent,
    /// otherwise whether a change was emitted.
    pub fn modify<F>(&mut self, key: &R::Key, f: F) -> Result<Option<bool>, CacheError>
    where
        F: FnOnce(&mut R),
    {
        let Some(record) = self.records.get_mut(key) else {
            return Ok(None);
        };

        let before = record.clone();
        f(record);

        if record.key() != *key {
            let after = record.key();
            *record = before;
            return Err(CacheError::KeyChanged {
                before: format!("{:?}", key),
                after: format!("{:?}", after),
            });
        }

        if *record == before {
            return Ok(Some(false));
        }

        let updated = record.clone();
        self.emit(Change::Updated(updated));
        Ok(Some(true))
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    /// Owned snapshot of every record, in no particular order.
    pub fn items(&self) -> Vec<R> {
        self.records.values().cloned().collect()
    }

    fn emit(&self, change: Change<R>) {
        if let Some(listener) = &self.listener {
            listener(&change);
        }
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}
