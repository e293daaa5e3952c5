use std::sync::Arc;

use xxhash_rust::xxh64::Xxh64;

use super::block::{Block, BlockSet, BlockSetMut, BlockStore};
use super::cipher::Cipher;
use super::page::{self, PageLayout, HASH_SEED, NO_LOGGABLE};
use super::tip::LogTip;
use crate::error::Result;

/// A page whose trailer has been written but which has not reached disk yet.
struct CompletedPage {
    address: u64,
    /// Bytes as stored: ciphered data area followed by the trailer.
    stored: Vec<u8>,
    /// Plaintext data area followed by the same trailer, as the cache holds it.
    plain: Arc<[u8]>,
}

/// What a flush put on disk.
#[derive(Default)]
pub struct Flushed {
    pub pages: Vec<(u64, Arc<[u8]>)>,
    pub touched: Vec<Arc<Block>>,
}

/// Appends bytes to the log page by page.
///
/// The checksum of the page being filled is computed incrementally over the
/// stored bytes, so completing a page costs one digest. Completed pages are
/// kept in memory until [`BufferedWriter::flush`]; the tail page is rewritten
/// from the last flushed offset on every flush.
pub struct BufferedWriter {
    layout: PageLayout,
    cipher: Option<Arc<dyn Cipher>>,
    page_address: u64,
    page: Vec<u8>,
    count: usize,
    flushed_count: usize,
    first_loggable: u32,
    hasher: Xxh64,
    completed: Vec<CompletedPage>,
}

impl BufferedWriter {
    /// Positions a writer at the end of `tip`.
    pub fn from_tip(tip: &LogTip, cipher: Option<Arc<dyn Cipher>>) -> Self {
        let layout = tip.layout;
        let mut page = vec![0u8; layout.capacity()];
        page[..tip.page.len()].copy_from_slice(&tip.page);

        let mut hasher = Xxh64::new(HASH_SEED);
        if !tip.page.is_empty() {
            let mut stored = tip.page.to_vec();
            if let Some(cipher) = &cipher {
                cipher.crypt(tip.page_address, &mut stored);
            }
            hasher.update(&stored);
        }

        Self {
            layout,
            cipher,
            page_address: tip.page_address,
            page,
            count: tip.page.len(),
            flushed_count: tip.page.len(),
            first_loggable: tip.first_loggable,
            hasher,
            completed: Vec::new(),
        }
    }

    /// Address the next byte will be written at.
    pub fn position(&self) -> u64 {
        self.page_address + self.count as u64
    }

    pub fn pending_pages(&self) -> usize {
        self.completed.len()
    }

    /// Appends one encoded loggable starting at the current position.
    pub fn write(&mut self, record: &[u8]) {
        self.mark_loggable();
        let mut rest = record;
        while !rest.is_empty() {
            let n = rest.len().min(self.layout.capacity() - self.count);
            self.append(&rest[..n]);
            rest = &rest[n..];
        }
    }

    /// Fills the log with one-byte null loggables up to `address`.
    pub fn pad_to(&mut self, address: u64, filler: u8) {
        while self.position() < address {
            self.mark_loggable();
            let left = self.layout.data_len(self.position(), address) as usize;
            let n = left.min(self.layout.capacity() - self.count);
            let fill = vec![filler; n];
            self.append(&fill);
        }
    }

    fn mark_loggable(&mut self) {
        if self.first_loggable == NO_LOGGABLE {
            self.first_loggable = self.count as u32;
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        let offset = self.count;
        self.page[offset..offset + bytes.len()].copy_from_slice(bytes);
        match &self.cipher {
            Some(cipher) => {
                let mut stored = bytes.to_vec();
                cipher.crypt(self.page_address + offset as u64, &mut stored);
                self.hasher.update(&stored);
            }
            None => self.hasher.update(bytes),
        }
        self.count += bytes.len();
        if self.count == self.layout.capacity() {
            self.complete_page();
        }
    }

    fn complete_page(&mut self) {
        let capacity = self.layout.capacity();
        let mut stored = vec![0u8; self.layout.page_size()];
        stored[..capacity].copy_from_slice(&self.page);
        if let Some(cipher) = &self.cipher {
            cipher.crypt(self.page_address, &mut stored[..capacity]);
        }

        self.hasher.update(&self.first_loggable.to_be_bytes());
        page::seal(&mut stored, self.first_loggable, self.hasher.digest());

        let mut plain = stored.clone();
        plain[..capacity].copy_from_slice(&self.page);

        self.completed.push(CompletedPage {
            address: self.page_address,
            stored,
            plain: Arc::from(plain),
        });

        self.page.fill(0);
        self.page_address += self.layout.page_size() as u64;
        self.count = 0;
        self.flushed_count = 0;
        self.first_loggable = NO_LOGGABLE;
        self.hasher = Xxh64::new(HASH_SEED);
    }

    /// Writes completed pages and the unflushed part of the tail page to their
    /// block files, creating files as the log crosses file boundaries.
    pub fn flush(&mut self, store: &BlockStore, blocks: &mut BlockSetMut) -> Result<Flushed> {
        let mut flushed = Flushed::default();

        for completed in std::mem::take(&mut self.completed) {
            let block = Self::block_for(store, blocks, completed.address)?;
            block.write_at(completed.address - block.address(), &completed.stored)?;
            Self::touch(&mut flushed.touched, &block);
            flushed.pages.push((completed.address, completed.plain));
        }

        if self.count > self.flushed_count {
            let address = self.page_address + self.flushed_count as u64;
            let mut stored = self.page[self.flushed_count..self.count].to_vec();
            if let Some(cipher) = &self.cipher {
                cipher.crypt(address, &mut stored);
            }
            let block = Self::block_for(store, blocks, address)?;
            block.write_at(address - block.address(), &stored)?;
            Self::touch(&mut flushed.touched, &block);
            self.flushed_count = self.count;
        }

        Ok(flushed)
    }

    fn block_for(store: &BlockStore, blocks: &mut BlockSetMut, address: u64) -> Result<Arc<Block>> {
        if let Some(block) = blocks.get(address) {
            return Ok(block.clone());
        }
        let file_address = address - address % store.file_length();
        let block = store.create(file_address)?;
        blocks.add(block.clone());
        Ok(block)
    }

    fn touch(touched: &mut Vec<Arc<Block>>, block: &Arc<Block>) {
        if !touched.iter().any(|b| b.address() == block.address()) {
            touched.push(block.clone());
        }
    }

    /// Tip describing everything written so far. Only meaningful after a flush.
    pub fn tip(&self, block_set: BlockSet) -> LogTip {
        LogTip {
            layout: self.layout,
            page_address: self.page_address,
            page: Arc::from(&self.page[..self.count]),
            first_loggable: self.first_loggable,
            high_address: self.position(),
            stored_high_address: self.position(),
            block_set,
        }
    }
}
