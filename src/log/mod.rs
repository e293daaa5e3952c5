//! Append-only log over fixed-length block files.
//!
//! # Addresses
//!
//! A log address is the byte position of a loggable in the concatenation of
//! all block files, trailers included. Block file `{address:016x}.xd` holds
//! `[address, address + file_length)`. Loggables never straddle a file: a
//! write that would is preceded by null padding up to the file end.
//!
//! # Concurrency
//!
//! Readers take the current [`LogTip`] and read below its high address without
//! further locking. A single [`LogWrite`] session at a time appends; its bytes
//! become visible only when [`LogWrite::end_write`] swaps in the new tip.
//! Dropping a session without ending it rolls the files back.

pub mod block;
pub mod cache;
pub mod cipher;
pub mod loggable;
pub mod page;
pub mod startup;
pub mod tip;
pub mod varint;
pub mod writer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use block::{Block, BlockSet, BlockSetMut, BlockStore};
use cache::{LogIdentity, PageCache};
use cipher::Cipher;
use loggable::{Loggable, LoggableIterator, PageSource, PageView, NULL_BYTE};
use page::{PageLayout, NO_LOGGABLE};
use startup::StartupMetadata;
use tip::LogTip;
use writer::BufferedWriter;

use crate::config::LogConfig;
use crate::error::{Bound, Result};
use crate::Error;

/// Completed pages a write session may hold in memory before spilling to disk.
const MAX_PENDING_PAGES: usize = 64;

pub struct Log {
    config: LogConfig,
    layout: PageLayout,
    store: BlockStore,
    cache: Arc<PageCache>,
    identity: LogIdentity,
    cipher: Option<Arc<dyn Cipher>>,
    tip: RwLock<Arc<LogTip>>,
    write_lock: Mutex<()>,
    unsynced: Mutex<BTreeMap<u64, Arc<Block>>>,
    startup_version: AtomicU64,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.store.dir())
            .field("identity", &self.identity)
            .field("high_address", &self.high_address())
            .finish()
    }
}

impl Log {
    pub fn open(config: LogConfig) -> Result<Self> {
        config.validate()?;
        let layout = PageLayout::new(config.page_size, config.file_length);
        let store = BlockStore::new(&config.dir, config.file_length)?;

        let startup = startup::load(store.dir())?;
        if let Some(meta) = startup {
            if meta.page_size as usize != config.page_size || meta.file_length != config.file_length {
                return Err(Error::InvalidInput(format!(
                    "log was created with page size {} and file length {}",
                    meta.page_size, meta.file_length
                )));
            }
        }

        let addresses = store.list()?;
        let mut blocks = BlockSet::new(config.file_length).begin_write();
        for (i, address) in addresses.iter().enumerate() {
            let block = store.open(*address)?;
            let len = block.len()?;
            let is_last = i + 1 == addresses.len();
            if !is_last && len != config.file_length {
                return Err(Error::DataCorruption(format!(
                    "block {:016x} has length {}, expected {}",
                    address, len, config.file_length
                )));
            }
            if len > config.file_length {
                return Err(Error::DataCorruption(format!(
                    "block {:016x} is longer than the file length",
                    address
                )));
            }
            blocks.add(block);
        }

        let cache = match &config.shared_cache {
            Some(cache) => cache.clone(),
            None => Arc::new(PageCache::new(config.cache_pages)),
        };
        let identity = cache.register_log();

        let log = Self {
            layout,
            store,
            identity,
            cipher: config.cipher.clone(),
            cache,
            tip: RwLock::new(Arc::new(LogTip::empty(layout))),
            write_lock: Mutex::new(()),
            unsynced: Mutex::new(BTreeMap::new()),
            startup_version: AtomicU64::new(startup.map_or(0, |m| m.version)),
            config,
        };

        let blocks = blocks.end_write();
        let high = match blocks.last_address().and_then(|address| blocks.get(address)) {
            Some(last) => last.address() + last.len()?,
            None => 0,
        };
        let tip = log.open_tip(blocks, high)?;
        tracing::info!(
            dir = %log.store.dir().display(),
            files = tip.block_set.len(),
            high_address = tip.high_address,
            "Opened log"
        );
        *log.tip.write()? = Arc::new(tip);

        Ok(log)
    }

    /// Builds the initial tip. A tail page that ends inside its trailer or
    /// whose first loggable cannot be located is left out of the readable log
    /// but stays on disk until recovery decides where the log ends.
    fn open_tip(&self, blocks: BlockSet, high: u64) -> Result<LogTip> {
        let offset = self.layout.page_offset(high);
        if offset < self.layout.capacity() {
            match self.build_tip(blocks.clone(), high) {
                Ok(tip) => return Ok(tip),
                Err(e) if e.is_corruption() => {
                    tracing::warn!(high_address = high, error = %e, "Tail page is unreadable");
                }
                Err(e) => return Err(e),
            }
        } else {
            tracing::warn!(high_address = high, "Tail page is torn");
        }
        let mut tip = self.build_tip(blocks, self.layout.page_address(high))?;
        tip.stored_high_address = high;
        Ok(tip)
    }

    /// Tip for a log whose files end at `high`.
    fn build_tip(&self, block_set: BlockSet, high: u64) -> Result<LogTip> {
        let high = self.layout.normalize(high);
        let page_address = self.layout.page_address(high);
        let count = (high - page_address) as usize;

        let mut data = vec![0u8; count];
        if count > 0 {
            let block = block_set.get(page_address).ok_or(Error::BlockNotFound {
                address: page_address,
                bound: Bound::Underflow,
            })?;
            let read = block.read_at(page_address - block.address(), &mut data)?;
            if read != count {
                return Err(Error::DataCorruption(format!(
                    "tail page at {} is shorter than expected",
                    page_address
                )));
            }
            if let Some(cipher) = &self.cipher {
                cipher.crypt(page_address, &mut data);
            }
        }

        let mut tip = LogTip {
            layout: self.layout,
            page_address,
            page: Arc::from(data),
            first_loggable: NO_LOGGABLE,
            high_address: high,
            stored_high_address: high,
            block_set,
        };
        tip.first_loggable = self.tail_first_loggable(&tip)?;
        Ok(tip)
    }

    /// The tail page has no trailer, so its first loggable is found by walking
    /// forward from the nearest earlier page that records one. Every file
    /// starts with a loggable, which bounds the walk.
    fn tail_first_loggable(&self, tip: &LogTip) -> Result<u32> {
        if tip.page.is_empty() {
            return Ok(NO_LOGGABLE);
        }
        let file_start = self.layout.file_address(tip.page_address);
        let mut address = file_start;
        let mut page_address = tip.page_address;
        while page_address > file_start {
            page_address -= self.layout.page_size() as u64;
            let view = self.page_view(tip, page_address)?;
            if let Some(offset) = view.first_loggable {
                address = page_address + offset as u64;
                break;
            }
        }

        let source = TipSource { log: self, tip };
        while address < tip.high_address {
            if address >= tip.page_address {
                return Ok((address - tip.page_address) as u32);
            }
            address = loggable::read_header(&source, address)?.end_address;
        }
        Ok(NO_LOGGABLE)
    }

    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn identity(&self) -> LogIdentity {
        self.identity
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn tip(&self) -> Arc<LogTip> {
        match self.tip.read() {
            Ok(tip) => tip.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn high_address(&self) -> u64 {
        self.tip().high_address
    }

    pub fn low_address(&self) -> u64 {
        self.tip().low_address()
    }

    pub fn file_addresses(&self) -> Vec<u64> {
        self.tip().block_set.addresses().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tip().is_empty()
    }

    /// Plaintext view of the page at `page_address` as seen by `tip`.
    fn page_view(&self, tip: &LogTip, page_address: u64) -> Result<PageView> {
        if page_address == tip.page_address {
            return Ok(PageView {
                data: tip.page.clone(),
                len: tip.page.len(),
                first_loggable: tip.first_loggable(),
            });
        }
        if page_address > tip.page_address {
            return Err(Error::BlockNotFound {
                address: page_address,
                bound: Bound::Overflow,
            });
        }
        let block = tip.block_set.get(page_address).ok_or(Error::BlockNotFound {
            address: page_address,
            bound: Bound::Underflow,
        })?;

        let data = match self.cache.get(self.identity, page_address)? {
            Some(data) => data,
            None => {
                let data = self.read_page(block, page_address)?;
                self.cache.insert(self.identity, page_address, data.clone())?;
                data
            }
        };
        Ok(PageView {
            first_loggable: page::first_loggable(&data),
            data,
            len: self.layout.capacity(),
        })
    }

    fn read_page(&self, block: &Block, page_address: u64) -> Result<Arc<[u8]>> {
        let mut data = vec![0u8; self.layout.page_size()];
        let read = block.read_at(page_address - block.address(), &mut data)?;
        if read != data.len() {
            return Err(Error::DataCorruption(format!(
                "page at {} is truncated to {} bytes",
                page_address, read
            )));
        }
        page::verify(&data, page_address)?;
        if let Some(cipher) = &self.cipher {
            cipher.crypt(page_address, &mut data[..self.layout.capacity()]);
        }
        Ok(Arc::from(data))
    }

    pub fn read(&self, address: u64) -> Result<Loggable> {
        let tip = self.tip();
        self.read_with(&tip, address)
    }

    pub fn read_with(&self, tip: &LogTip, address: u64) -> Result<Loggable> {
        if address < tip.low_address() {
            return Err(Error::BlockNotFound {
                address,
                bound: Bound::Underflow,
            });
        }
        loggable::read(&TipSource { log: self, tip }, address)
    }

    /// Reads the loggable at `address` and checks that it has the given type.
    pub fn read_expecting(&self, tip: &LogTip, address: u64, kind: u8) -> Result<Loggable> {
        let loggable = self.read_with(tip, address)?;
        if loggable.kind() != kind {
            return Err(Error::DataCorruption(format!(
                "expected loggable type {} at address {}, found {}",
                kind,
                address,
                loggable.kind()
            )));
        }
        Ok(loggable)
    }

    /// Source for reading through a fixed tip.
    pub fn source<'a>(&'a self, tip: &'a LogTip) -> TipSource<'a> {
        TipSource { log: self, tip }
    }

    /// Address of the first loggable starting in the page at `page_address`.
    pub fn first_loggable_in_page(&self, tip: &LogTip, page_address: u64) -> Result<Option<u64>> {
        let view = self.page_view(tip, page_address)?;
        Ok(view.first_loggable.map(|offset| page_address + offset as u64))
    }

    pub fn begin_write(&self) -> Result<LogWrite<'_>> {
        let guard = self.write_lock.lock()?;
        let initial = self.tip();
        if initial.has_unreadable_tail() {
            return Err(Error::InvalidState(format!(
                "log ends in an unreadable tail at {}, recover it before writing",
                initial.high_address
            )));
        }
        let writer = BufferedWriter::from_tip(&initial, self.cipher.clone());
        let blocks = initial.block_set.begin_write();
        Ok(LogWrite {
            log: self,
            _guard: guard,
            initial,
            writer,
            blocks: Some(blocks),
            spilled: false,
            finished: false,
        })
    }

    fn record_flushed(&self, flushed: writer::Flushed) -> Result<()> {
        for (address, data) in flushed.pages {
            self.cache.insert(self.identity, address, data)?;
        }
        let mut unsynced = self.unsynced.lock()?;
        for block in flushed.touched {
            unsynced.insert(block.address(), block);
        }
        Ok(())
    }

    /// Makes every write so far durable.
    pub fn sync(&self) -> Result<()> {
        let blocks = std::mem::take(&mut *self.unsynced.lock()?);
        for block in blocks.values() {
            block.sync()?;
        }
        Ok(())
    }

    /// Discards everything at and after `address`.
    pub fn set_high_address(&self, address: u64) -> Result<Arc<LogTip>> {
        let _guard = self.write_lock.lock()?;
        let current = self.tip();
        let address = self.layout.normalize(address);
        if address > current.high_address {
            return Err(Error::InvalidInput(format!(
                "cannot raise high address from {} to {}",
                current.high_address, address
            )));
        }
        if address == current.high_address && !current.has_unreadable_tail() {
            return Ok(current);
        }

        let blocks = self.truncate_blocks(&current.block_set, address)?;
        let tip = Arc::new(self.build_tip(blocks, address)?);
        *self.tip.write()? = tip.clone();
        tracing::info!(from = current.stored_high_address, to = address, "Truncated log");
        Ok(tip)
    }

    /// Shrinks the files of `blocks` so that the log ends at `address`.
    fn truncate_blocks(&self, blocks: &BlockSet, address: u64) -> Result<BlockSet> {
        self.cache.remove_from(self.identity, self.layout.page_address(address))?;
        let mut writer = blocks.begin_write();
        for block in blocks.blocks() {
            if block.address() >= address {
                self.store.remove(block.address())?;
                writer.remove(block.address());
                self.unsynced.lock()?.remove(&block.address());
            } else if block.address() + self.layout.file_length() > address {
                block.truncate(address - block.address())?;
            }
        }
        Ok(writer.end_write())
    }

    /// Drops files from the visible block set without deleting them.
    pub fn forget_files(&self, addresses: &[u64]) -> Result<()> {
        let _guard = self.write_lock.lock()?;
        let current = self.tip();
        let last = current.block_set.last_address();
        let mut blocks = current.block_set.begin_write();
        for address in addresses {
            if Some(*address) == last {
                return Err(Error::InvalidOperation(format!(
                    "cannot forget the last file {:016x}",
                    address
                )));
            }
            blocks.remove(*address);
        }
        let mut tip = (*current).clone();
        tip.block_set = blocks.end_write();
        *self.tip.write()? = Arc::new(tip);
        Ok(())
    }

    /// Deletes a block file that is no longer part of the block set.
    pub fn remove_file(&self, address: u64) -> Result<()> {
        if self.tip().block_set.contains(address) {
            return Err(Error::InvalidOperation(format!(
                "file {:016x} is still part of the log",
                address
            )));
        }
        self.unsynced.lock()?.remove(&address);
        self.cache
            .remove_range(self.identity, address, address + self.layout.file_length())?;
        self.store.remove(address)?;
        tracing::debug!(address, "Removed log file");
        Ok(())
    }

    pub fn startup_metadata(&self) -> Result<Option<StartupMetadata>> {
        startup::load(self.store.dir())
    }

    /// Persists the root address and shutdown state into the next startup slot.
    pub fn write_startup(&self, root_address: u64, clean: bool) -> Result<()> {
        let version = self.startup_version.fetch_add(1, Ordering::SeqCst) + 1;
        startup::store(
            self.store.dir(),
            &StartupMetadata {
                version,
                page_size: self.layout.page_size() as u32,
                file_length: self.layout.file_length(),
                root_address,
                clean,
            },
        )
    }

    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.cache.remove_from(self.identity, 0)?;
        tracing::info!(dir = %self.store.dir().display(), "Closed log");
        Ok(())
    }
}

/// Reads the log as it was at one tip.
pub struct TipSource<'a> {
    log: &'a Log,
    tip: &'a LogTip,
}

impl TipSource<'_> {
    pub fn iter_from(&self, address: u64) -> LoggableIterator<'_, Self> {
        LoggableIterator::new(self, address)
    }

    pub fn iter_range(&self, start: u64, end: u64) -> LoggableIterator<'_, Self> {
        LoggableIterator::bounded(self, start, end)
    }
}

impl PageSource for TipSource<'_> {
    fn layout(&self) -> PageLayout {
        self.log.layout
    }

    fn high_address(&self) -> u64 {
        self.tip.high_address
    }

    fn page(&self, page_address: u64) -> Result<PageView> {
        self.log.page_view(self.tip, page_address)
    }
}

/// Exclusive append session.
pub struct LogWrite<'a> {
    log: &'a Log,
    _guard: MutexGuard<'a, ()>,
    initial: Arc<LogTip>,
    writer: BufferedWriter,
    blocks: Option<BlockSetMut>,
    spilled: bool,
    finished: bool,
}

impl LogWrite<'_> {
    /// Address the next loggable will be written at.
    pub fn position(&self) -> u64 {
        self.writer.position()
    }

    pub fn initial_tip(&self) -> &Arc<LogTip> {
        &self.initial
    }

    /// Largest data a single [`write`](Self::write) accepts for `structure_id`.
    pub fn max_data_len(&self, structure_id: u64) -> u64 {
        loggable::max_data_len(&self.log.layout, structure_id)
    }

    /// Appends a loggable and returns its address.
    pub fn write(&mut self, kind: u8, structure_id: u64, data: &[u8]) -> Result<u64> {
        let mut record = Vec::new();
        loggable::encode(kind, structure_id, data, &mut record)?;

        let layout = self.log.layout;
        let file_length = layout.file_length();
        let start = layout.normalize(self.writer.position());
        let file_start = layout.file_address(start);
        let len = record.len() as u64;

        let too_large = || Error::RecordTooLarge {
            length: len,
            file_length,
        };
        let next_file = file_start + file_length;
        if layout.advance(start, len).ok_or_else(too_large)? > next_file {
            if layout.advance(next_file, len).ok_or_else(too_large)? > next_file + file_length {
                return Err(too_large());
            }
            self.writer.pad_to(next_file, NULL_BYTE);
        }

        let address = layout.normalize(self.writer.position());
        self.writer.write(&record);

        if self.writer.pending_pages() >= MAX_PENDING_PAGES {
            self.flush()?;
        }
        Ok(address)
    }

    /// Pads the current file with null loggables so the next write starts a new file.
    pub fn pad_to_file_end(&mut self) {
        let layout = self.log.layout;
        let position = layout.normalize(self.writer.position());
        if position % layout.file_length() != 0 {
            let end = layout.file_address(position) + layout.file_length();
            self.writer.pad_to(end, NULL_BYTE);
        }
    }

    fn flush(&mut self) -> Result<()> {
        let blocks = self
            .blocks
            .as_mut()
            .ok_or_else(|| Error::InvalidState("write session already ended".to_string()))?;
        self.spilled = true;
        let flushed = self.writer.flush(&self.log.store, blocks)?;
        self.log.record_flushed(flushed)
    }

    /// Flushes the session and publishes its bytes.
    pub fn end_write(mut self) -> Result<Arc<LogTip>> {
        self.flush()?;
        let blocks = self
            .blocks
            .as_ref()
            .ok_or_else(|| Error::InvalidState("write session already ended".to_string()))?;
        let tip = Arc::new(self.writer.tip(blocks.snapshot()));

        {
            let mut current = self.log.tip.write()?;
            if !Arc::ptr_eq(&current, &self.initial) {
                return Err(Error::InvalidState(
                    "log tip changed during a write session".to_string(),
                ));
            }
            *current = tip.clone();
        }
        self.finished = true;

        if self.log.config.durable_write {
            self.log.sync()?;
        }
        Ok(tip)
    }

    /// Discards the session; bytes already spilled to disk are truncated away.
    pub fn abort(mut self) -> Result<()> {
        self.rollback()
    }

    fn rollback(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if !self.spilled {
            return Ok(());
        }
        let initial = &self.initial;
        let mut blocks = initial.block_set.begin_write();
        if let Some(session_blocks) = self.blocks.take() {
            for block in session_blocks.snapshot().blocks() {
                blocks.add(block.clone());
            }
        }
        self.log
            .truncate_blocks(&blocks.end_write(), initial.high_address)?;
        tracing::debug!(high_address = initial.high_address, "Rolled back log write");
        Ok(())
    }
}

impl Drop for LogWrite<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.rollback() {
            tracing::error!(error = %e, "Failed to roll back log write");
        }
    }
}
