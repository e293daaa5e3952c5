//! Page cache shared by one or more logs.
//!
//! Eviction follows S3-FIFO: new pages enter a small FIFO queue, pages touched
//! again before leaving it are promoted to the main queue, and keys evicted from
//! the small queue are remembered in a ghost queue so a quick re-read goes
//! straight to main.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Maximum frequency an entry can accumulate.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Distinguishes the pages of different logs sharing one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogIdentity(u64);

impl LogIdentity {
    pub fn value(&self) -> u64 {
        self.0
    }
}

type PageKey = (LogIdentity, u64);

struct Slot {
    page: Arc<[u8]>,
    freq: u8,
    in_main: bool,
    generation: u64,
}

struct Queues {
    max_small_size: usize,
    max_cache_size: usize,
    /// new entries are added to this queue
    small: VecDeque<(PageKey, u64)>,
    /// entries read again while in small are moved here
    main: VecDeque<(PageKey, u64)>,
    /// keys evicted from small before being read again
    ghost: VecDeque<PageKey>,
    ghost_keys: HashSet<PageKey>,
    entries: HashMap<PageKey, Slot>,
    next_generation: u64,
}

impl Queues {
    fn new(max_cache_size: usize) -> Self {
        Self {
            max_small_size: (max_cache_size / 10).max(1),
            max_cache_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    fn get(&mut self, key: &PageKey) -> Option<Arc<[u8]>> {
        let slot = self.entries.get_mut(key)?;
        slot.freq = (slot.freq + 1).min(MAX_FREQUENCY_LIMIT);
        Some(slot.page.clone())
    }

    fn insert(&mut self, key: PageKey, page: Arc<[u8]>) {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.page = page;
            return;
        }

        while self.entries.len() >= self.max_cache_size {
            self.evict();
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let in_main = self.ghost_keys.remove(&key);
        if in_main {
            self.main.push_back((key, generation));
        } else {
            self.small.push_back((key, generation));
        }
        self.entries.insert(
            key,
            Slot {
                page,
                freq: 0,
                in_main,
                generation,
            },
        );
    }

    fn is_live(&self, key: &PageKey, generation: u64, in_main: bool) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| slot.generation == generation && slot.in_main == in_main)
    }

    fn evict(&mut self) {
        if self.small.len() >= self.max_small_size || self.main.is_empty() {
            if self.evict_small() {
                return;
            }
        }
        if !self.evict_main() {
            self.evict_small();
        }
    }

    fn evict_small(&mut self) -> bool {
        while let Some((key, generation)) = self.small.pop_front() {
            if !self.is_live(&key, generation, false) {
                continue;
            }
            let promote = self.entries.get(&key).is_some_and(|slot| slot.freq > 1);
            if promote {
                if let Some(slot) = self.entries.get_mut(&key) {
                    slot.in_main = true;
                    slot.freq = 0;
                }
                self.main.push_back((key, generation));
            } else {
                self.entries.remove(&key);
                self.remember_ghost(key);
                return true;
            }
        }
        false
    }

    fn evict_main(&mut self) -> bool {
        while let Some((key, generation)) = self.main.pop_front() {
            if !self.is_live(&key, generation, true) {
                continue;
            }
            let keep = match self.entries.get_mut(&key) {
                Some(slot) if slot.freq > 0 => {
                    slot.freq -= 1;
                    true
                }
                _ => false,
            };
            if keep {
                self.main.push_back((key, generation));
            } else {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn remember_ghost(&mut self, key: PageKey) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        if self.ghost_keys.insert(key) {
            self.ghost.push_back(key);
        }
    }
}

/// Cache of log pages keyed by `(LogIdentity, page address)`.
pub struct PageCache {
    queues: Mutex<Queues>,
    next_identity: AtomicU64,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (hits, misses) = self.stats();
        f.debug_struct("PageCache")
            .field("hits", &hits)
            .field("misses", &misses)
            .finish()
    }
}

impl PageCache {
    pub fn new(max_pages: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::new(max_pages.max(1))),
            next_identity: AtomicU64::new(1),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Hands out an identity unique within this cache.
    pub fn register_log(&self) -> LogIdentity {
        LogIdentity(self.next_identity.fetch_add(1, Ordering::SeqCst))
    }

    pub fn get(&self, log: LogIdentity, page_address: u64) -> Result<Option<Arc<[u8]>>> {
        let page = self.queues.lock()?.get(&(log, page_address));
        match page {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(page)
    }

    pub fn insert(&self, log: LogIdentity, page_address: u64, page: Arc<[u8]>) -> Result<()> {
        self.queues.lock()?.insert((log, page_address), page);
        Ok(())
    }

    /// Forgets every page of `log` at or after `from_address`.
    pub fn remove_from(&self, log: LogIdentity, from_address: u64) -> Result<()> {
        let mut queues = self.queues.lock()?;
        queues
            .entries
            .retain(|(id, address), _| *id != log || *address < from_address);
        Ok(())
    }

    /// Forgets every page of `log` in `[start, end)`.
    pub fn remove_range(&self, log: LogIdentity, start: u64, end: u64) -> Result<()> {
        let mut queues = self.queues.lock()?;
        queues
            .entries
            .retain(|(id, address), _| *id != log || *address < start || *address >= end);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queues.lock().map(|q| q.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Arc<[u8]> {
        Arc::from(vec![byte; 16])
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let cache = PageCache::new(4);
        let log = cache.register_log();

        cache.insert(log, 0, page(1))?;
        cache.insert(log, 1024, page(2))?;

        assert_eq!(cache.get(log, 0)?.unwrap()[0], 1);
        assert_eq!(cache.get(log, 1024)?.unwrap()[0], 2);
        assert!(cache.get(log, 2048)?.is_none());
        assert_eq!(cache.stats(), (2, 1));

        Ok(())
    }

    #[test]
    fn test_identities_do_not_collide() -> Result<()> {
        let cache = PageCache::new(8);
        let first = cache.register_log();
        let second = cache.register_log();
        assert_ne!(first, second);

        cache.insert(first, 0, page(1))?;
        cache.insert(second, 0, page(2))?;

        assert_eq!(cache.get(first, 0)?.unwrap()[0], 1);
        assert_eq!(cache.get(second, 0)?.unwrap()[0], 2);

        Ok(())
    }

    #[test]
    fn test_capacity_is_respected() -> Result<()> {
        let cache = PageCache::new(3);
        let log = cache.register_log();

        for i in 0..10u64 {
            cache.insert(log, i * 1024, page(i as u8))?;
            assert!(cache.len() <= 3);
        }
        assert!(cache.get(log, 9 * 1024)?.is_some());

        Ok(())
    }

    #[test]
    fn test_frequently_read_page_survives() -> Result<()> {
        let cache = PageCache::new(3);
        let log = cache.register_log();

        cache.insert(log, 0, page(0))?;
        cache.get(log, 0)?;
        cache.get(log, 0)?;
        for i in 1..10u64 {
            cache.insert(log, i * 1024, page(i as u8))?;
        }

        assert!(cache.get(log, 0)?.is_some());

        Ok(())
    }

    #[test]
    fn test_remove_from() -> Result<()> {
        let cache = PageCache::new(8);
        let log = cache.register_log();
        let other = cache.register_log();

        for i in 0..4u64 {
            cache.insert(log, i * 1024, page(i as u8))?;
        }
        cache.insert(other, 3 * 1024, page(9))?;

        cache.remove_from(log, 2048)?;

        assert!(cache.get(log, 1024)?.is_some());
        assert!(cache.get(log, 2048)?.is_none());
        assert!(cache.get(log, 3072)?.is_none());
        assert!(cache.get(other, 3072)?.is_some());

        // reinserting a removed key must not resurrect stale queue entries
        cache.insert(log, 2048, page(7))?;
        assert_eq!(cache.get(log, 2048)?.unwrap()[0], 7);

        Ok(())
    }
}
