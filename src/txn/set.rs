//! Registry of live snapshots.
//!
//! Entries are keyed by `(root address, snapshot id)` in a lock-free ordered
//! map, so the oldest and newest roots still visible to some transaction are
//! the first and last keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub root: u64,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub txn_id: u64,
    pub thread_name: String,
    pub started: Instant,
}

impl SnapshotInfo {
    pub fn new(txn_id: u64) -> Self {
        let current = std::thread::current();
        Self {
            txn_id,
            thread_name: current.name().unwrap_or("unnamed").to_string(),
            started: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Default)]
pub struct TransactionSet {
    snapshots: SkipMap<SnapshotKey, SnapshotInfo>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TransactionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSet")
            .field("len", &self.len())
            .field("oldest_root", &self.oldest_root())
            .finish()
    }
}

impl TransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, root: u64, info: SnapshotInfo) -> SnapshotKey {
        let key = SnapshotKey {
            root,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.snapshots.insert(key, info);
        key
    }

    /// Moves a snapshot to a newer root, keeping its registration details.
    pub fn rebase(&self, key: &SnapshotKey, root: u64, txn_id: u64) -> SnapshotKey {
        let info = match self.snapshots.remove(key) {
            Some(entry) => entry.value().clone(),
            None => SnapshotInfo::new(txn_id),
        };
        self.add(root, info)
    }

    pub fn remove(&self, key: &SnapshotKey) -> bool {
        self.snapshots.remove(key).is_some()
    }

    pub fn contains(&self, key: &SnapshotKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Id the next registered snapshot will get.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn oldest_root(&self) -> Option<u64> {
        self.snapshots.front().map(|entry| entry.key().root)
    }

    pub fn newest_root(&self) -> Option<u64> {
        self.snapshots.back().map(|entry| entry.key().root)
    }

    /// Smallest snapshot id still registered.
    pub fn oldest_id(&self) -> Option<u64> {
        self.snapshots.iter().map(|entry| entry.key().id).min()
    }

    /// Snapshots registered for longer than `age`.
    pub fn older_than(&self, age: Duration) -> Vec<(SnapshotKey, SnapshotInfo)> {
        self.snapshots
            .iter()
            .filter(|entry| entry.value().age() > age)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}
