//! Interface between the environment and a log garbage collector.
//!
//! The collector itself (choosing files to clean, copying live loggables) lives
//! outside this crate. The environment only tells it which loggables each
//! commit made unreachable and lets it pause while something else needs the
//! log to stay put.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::log::page::PageLayout;
use crate::tree::ExpiredLoggables;

pub trait GcHooks: Send + Sync {
    fn suspend(&self);

    fn resume(&self);

    /// Called after every commit, outside the commit lock.
    fn fetch_expired_loggables(&self, expired: ExpiredLoggables);
}

/// Counts expired bytes per log file.
///
/// A collector picks the files with the most expired bytes first; this keeps
/// only the bookkeeping half of that.
#[derive(Debug)]
pub struct UtilizationTracker {
    layout: PageLayout,
    expired: Mutex<BTreeMap<u64, u64>>,
    suspended: AtomicUsize,
}

impl UtilizationTracker {
    pub fn new(layout: PageLayout) -> Self {
        Self {
            layout,
            expired: Mutex::new(BTreeMap::new()),
            suspended: AtomicUsize::new(0),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    pub fn expired_bytes(&self, file_address: u64) -> u64 {
        match self.expired.lock() {
            Ok(expired) => expired.get(&file_address).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(&file_address).copied().unwrap_or(0),
        }
    }

    /// Files ordered by expired bytes, most first.
    pub fn candidates(&self) -> Vec<(u64, u64)> {
        let expired = match self.expired.lock() {
            Ok(expired) => expired.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut files: Vec<(u64, u64)> = expired.into_iter().collect();
        files.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        files
    }

    /// Forgets the counters of removed files.
    pub fn remove_files(&self, addresses: &[u64]) {
        if let Ok(mut expired) = self.expired.lock() {
            for address in addresses {
                expired.remove(address);
            }
        }
    }
}

impl GcHooks for UtilizationTracker {
    fn suspend(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        let _ = self
            .suspended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn fetch_expired_loggables(&self, expired: ExpiredLoggables) {
        let mut files = match self.expired.lock() {
            Ok(files) => files,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (address, length) in expired.iter() {
            *files.entry(self.layout.file_address(*address)).or_insert(0) += length;
        }
        tracing::trace!(loggables = expired.len(), bytes = expired.total_length(), "Recorded expired loggables");
    }
}
