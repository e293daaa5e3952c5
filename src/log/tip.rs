use std::sync::Arc;

use super::block::BlockSet;
use super::page::{PageLayout, NO_LOGGABLE};

/// Immutable snapshot of the end of the log.
///
/// Readers hold an `Arc<LogTip>` and see exactly the bytes below its high
/// address, whatever a concurrent write session appends. The last page has no
/// trailer yet, so its plaintext data prefix lives here rather than in the
/// page cache.
#[derive(Debug, Clone)]
pub struct LogTip {
    pub(crate) layout: PageLayout,
    pub(crate) page_address: u64,
    pub(crate) page: Arc<[u8]>,
    pub(crate) first_loggable: u32,
    pub(crate) high_address: u64,
    pub(crate) stored_high_address: u64,
    pub(crate) block_set: BlockSet,
}

impl LogTip {
    pub(crate) fn empty(layout: PageLayout) -> Self {
        Self {
            layout,
            page_address: 0,
            page: Arc::from(Vec::new()),
            first_loggable: NO_LOGGABLE,
            high_address: 0,
            stored_high_address: 0,
            block_set: BlockSet::new(layout.file_length()),
        }
    }

    /// First address not yet written.
    pub fn high_address(&self) -> u64 {
        self.high_address
    }

    /// End of the bytes present in the block files. Above the high address
    /// only when the log was opened with a tail it could not read; nothing can
    /// be written until recovery cuts that tail with `set_high_address`.
    pub fn stored_high_address(&self) -> u64 {
        self.stored_high_address
    }

    pub fn has_unreadable_tail(&self) -> bool {
        self.stored_high_address > self.high_address
    }

    pub fn page_address(&self) -> u64 {
        self.page_address
    }

    /// Bytes written to the last page.
    pub fn count(&self) -> usize {
        self.page.len()
    }

    pub fn first_loggable(&self) -> Option<usize> {
        match self.first_loggable {
            NO_LOGGABLE => None,
            offset => Some(offset as usize),
        }
    }

    pub fn block_set(&self) -> &BlockSet {
        &self.block_set
    }

    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    pub fn is_empty(&self) -> bool {
        self.block_set.is_empty() && self.high_address == 0
    }

    /// Address of the first byte still present in the log.
    pub fn low_address(&self) -> u64 {
        self.block_set.first_address().unwrap_or(self.high_address)
    }
}
