use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::log::cache::PageCache;
use crate::log::cipher::Cipher;
use crate::Error;

const MIN_PAGE_SIZE: usize = 256;

/// Configuration for the log and its block files
#[derive(Clone)]
pub struct LogConfig {
    /// Directory holding block files (default: ./cinderdb)
    pub dir: PathBuf,

    /// Length of every block file in bytes (default: 1MB)
    pub file_length: u64,

    /// Size of a log page; file_length must be a multiple of it (default: 64KB)
    pub page_size: usize,

    /// Number of pages kept by an exclusive page cache (default: 1024)
    pub cache_pages: usize,

    /// Shared page cache; when unset the log creates its own
    pub shared_cache: Option<Arc<PageCache>>,

    /// Cipher applied to page data (default: none)
    pub cipher: Option<Arc<dyn Cipher>>,

    /// fsync after every completed write session (default: false)
    pub durable_write: bool,
}

impl std::fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogConfig")
            .field("dir", &self.dir)
            .field("file_length", &self.file_length)
            .field("page_size", &self.page_size)
            .field("cache_pages", &self.cache_pages)
            .field("shared_cache", &self.shared_cache.is_some())
            .field("cipher", &self.cipher.is_some())
            .field("durable_write", &self.durable_write)
            .finish()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            file_length: 1024 * 1024,
            page_size: 64 * 1024,
            cache_pages: 1024,
            shared_cache: None,
            cipher: None,
            durable_write: false,
        }
    }
}

impl LogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn file_length(mut self, length: u64) -> Self {
        self.file_length = length;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn shared_cache(mut self, cache: Arc<PageCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn durable_write(mut self, enabled: bool) -> Self {
        self.durable_write = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidInput(format!(
                "page size must be a power of two of at least {} bytes, got {}",
                MIN_PAGE_SIZE, self.page_size
            )));
        }
        if self.file_length == 0 || self.file_length % self.page_size as u64 != 0 {
            return Err(Error::InvalidInput(format!(
                "file length {} must be a non-zero multiple of page size {}",
                self.file_length, self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(Error::InvalidInput(
                "page cache must hold at least one page".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an environment
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub log: LogConfig,

    /// Maximum concurrent read-write transactions (default: 16)
    pub max_read_write_txns: usize,

    /// Maximum concurrent read-only transactions (default: 256)
    pub max_readonly_txns: usize,

    /// Replays after which a transaction escalates to exclusive (default: 2)
    pub txn_replay_max_count: u32,

    /// Time spent replaying after which a transaction escalates to exclusive (default: 2s)
    pub txn_replay_timeout: Duration,

    /// How long a GC transaction waits for exclusivity (default: 1s)
    pub gc_txn_acquire_timeout: Duration,

    /// Transactions older than this are reported as stuck (default: disabled)
    pub txn_timeout: Option<Duration>,

    /// How often the stuck transaction monitor runs (default: 10s)
    pub txn_monitor_interval: Duration,

    /// Periodic log sync; disabled when unset (default: 10s)
    pub log_sync_period: Option<Duration>,

    /// Close even if transactions are still open (default: false)
    pub close_forcedly: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            max_read_write_txns: 16,
            max_readonly_txns: 256,
            txn_replay_max_count: 2,
            txn_replay_timeout: Duration::from_secs(2),
            gc_txn_acquire_timeout: Duration::from_secs(1),
            txn_timeout: None,
            txn_monitor_interval: Duration::from_secs(10),
            log_sync_period: Some(Duration::from_secs(10)),
            close_forcedly: false,
        }
    }
}

impl EnvironmentConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            log: LogConfig::new(dir),
            ..Default::default()
        }
    }

    pub fn file_length(mut self, length: u64) -> Self {
        self.log.file_length = length;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.log.page_size = size;
        self
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.log.cache_pages = pages;
        self
    }

    pub fn shared_cache(mut self, cache: Arc<PageCache>) -> Self {
        self.log.shared_cache = Some(cache);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.log.cipher = Some(cipher);
        self
    }

    pub fn durable_write(mut self, enabled: bool) -> Self {
        self.log.durable_write = enabled;
        self
    }

    pub fn max_read_write_txns(mut self, max: usize) -> Self {
        self.max_read_write_txns = max;
        self
    }

    pub fn max_readonly_txns(mut self, max: usize) -> Self {
        self.max_readonly_txns = max;
        self
    }

    pub fn txn_replay_max_count(mut self, count: u32) -> Self {
        self.txn_replay_max_count = count;
        self
    }

    pub fn txn_replay_timeout(mut self, timeout: Duration) -> Self {
        self.txn_replay_timeout = timeout;
        self
    }

    pub fn gc_txn_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.gc_txn_acquire_timeout = timeout;
        self
    }

    pub fn txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = Some(timeout);
        self
    }

    pub fn txn_monitor_interval(mut self, interval: Duration) -> Self {
        self.txn_monitor_interval = interval;
        self
    }

    pub fn log_sync_period(mut self, period: Option<Duration>) -> Self {
        self.log_sync_period = period;
        self
    }

    pub fn close_forcedly(mut self, enabled: bool) -> Self {
        self.close_forcedly = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        if self.max_read_write_txns == 0 || self.max_readonly_txns == 0 {
            return Err(Error::InvalidInput(
                "transaction limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.log.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.log.file_length, 1024 * 1024);
        assert_eq!(config.log.page_size, 64 * 1024);
        assert!(!config.log.durable_write);
        assert_eq!(config.max_read_write_txns, 16);
        assert_eq!(config.txn_replay_max_count, 2);
        assert!(config.txn_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EnvironmentConfig::new("/tmp/test")
            .file_length(16 * 1024)
            .page_size(1024)
            .cache_pages(8)
            .durable_write(true)
            .max_read_write_txns(4)
            .txn_replay_max_count(5)
            .txn_timeout(Duration::from_millis(500))
            .log_sync_period(None);

        assert_eq!(config.log.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.log.file_length, 16 * 1024);
        assert_eq!(config.log.page_size, 1024);
        assert_eq!(config.log.cache_pages, 8);
        assert!(config.log.durable_write);
        assert_eq!(config.max_read_write_txns, 4);
        assert_eq!(config.txn_replay_max_count, 5);
        assert_eq!(config.txn_timeout, Some(Duration::from_millis(500)));
        assert!(config.log_sync_period.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_length_must_be_page_multiple() {
        let config = LogConfig::new("/tmp/test").page_size(1024).file_length(1500);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let config = LogConfig::new("/tmp/test").page_size(1000).file_length(4000);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }
}
