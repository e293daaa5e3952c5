use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    log::Log,
    scheduler::{BackgroundTask, Context},
    txn::set::TransactionSet,
};

/// Reports transactions that stay open longer than the configured timeout.
/// Nothing is aborted.
pub struct StuckTransactionMonitor {
    txns: Arc<TransactionSet>,
    timeout: Duration,
    interval: Duration,
}

impl StuckTransactionMonitor {
    pub fn new(txns: Arc<TransactionSet>, timeout: Duration, interval: Duration) -> Self {
        Self {
            txns,
            timeout,
            interval,
        }
    }

    /// Logs every stuck transaction and returns how many there were.
    pub fn check(&self) -> usize {
        let stuck = self.txns.older_than(self.timeout);
        for (key, info) in &stuck {
            tracing::warn!(
                txn = info.txn_id,
                thread = %info.thread_name,
                root = key.root,
                age_ms = info.age().as_millis() as u64,
                "Transaction has been open too long"
            );
        }
        stuck.len()
    }
}

#[async_trait::async_trait]
impl BackgroundTask for StuckTransactionMonitor {
    fn name(&self) -> &'static str {
        "stuck-transaction-monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.check();
        Ok(())
    }
}

/// Periodically fsyncs the log files written since the last sync.
pub struct LogSyncTask {
    log: Arc<Log>,
    period: Duration,
}

impl LogSyncTask {
    pub fn new(log: Arc<Log>, period: Duration) -> Self {
        Self { log, period }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for LogSyncTask {
    fn name(&self) -> &'static str {
        "log-sync"
    }

    fn interval(&self) -> Duration {
        self.period
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.log.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::set::SnapshotInfo;

    #[test]
    fn test_monitor_reports_old_transactions() {
        let txns = Arc::new(TransactionSet::new());
        let monitor = StuckTransactionMonitor::new(
            txns.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert_eq!(monitor.check(), 0);

        let key = txns.add(0, SnapshotInfo::new(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(monitor.check(), 1);

        txns.remove(&key);
        assert_eq!(monitor.check(), 0);
    }
}
