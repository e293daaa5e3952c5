//! Block files and the copy-on-write set of blocks a log tip refers to.
//!
//! A block is one fixed-length file named after the log address of its first
//! byte. Blocks are only ever appended to, truncated during recovery, or removed
//! whole once the garbage collector no longer needs them.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

pub const BLOCK_EXTENSION: &str = "xd";

pub struct Block {
    address: u64,
    path: PathBuf,
    file: File,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("address", &self.address)
            .field("path", &self.path)
            .finish()
    }
}

impl Block {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads as many bytes as are present at `offset`, up to `buf.len()`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Directory of block files of one fixed length.
#[derive(Debug, Clone)]
pub struct BlockStore {
    dir: PathBuf,
    file_length: u64,
}

impl BlockStore {
    pub fn new(dir: impl Into<PathBuf>, file_length: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, file_length })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn path_of(&self, address: u64) -> PathBuf {
        self.dir
            .join(format!("{:016x}.{}", address, BLOCK_EXTENSION))
    }

    /// Addresses of every block file present, ascending.
    pub fn list(&self) -> Result<Vec<u64>> {
        let mut addresses = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
                continue;
            }
            let address = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| u64::from_str_radix(stem, 16).ok());
            match address {
                Some(address) if address % self.file_length == 0 => addresses.push(address),
                _ => tracing::warn!(path = %path.display(), "Ignoring unexpected file in log directory"),
            }
        }
        addresses.sort_unstable();
        Ok(addresses)
    }

    pub fn open(&self, address: u64) -> Result<Arc<Block>> {
        let path = self.path_of(address);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Arc::new(Block {
            address,
            path,
            file,
        }))
    }

    pub fn create(&self, address: u64) -> Result<Arc<Block>> {
        let path = self.path_of(address);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        tracing::debug!(address, path = %path.display(), "Created block file");
        Ok(Arc::new(Block {
            address,
            path,
            file,
        }))
    }

    pub fn remove(&self, address: u64) -> Result<()> {
        match fs::remove_file(self.path_of(address)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Immutable view of the blocks making up a log, keyed by `address / file_length`.
#[derive(Debug, Clone)]
pub struct BlockSet {
    file_length: u64,
    blocks: Arc<BTreeMap<u64, Arc<Block>>>,
}

impl BlockSet {
    pub fn new(file_length: u64) -> Self {
        Self {
            file_length,
            blocks: Arc::new(BTreeMap::new()),
        }
    }

    /// Block containing `address`, if it is still part of the log.
    pub fn get(&self, address: u64) -> Option<&Arc<Block>> {
        self.blocks.get(&(address / self.file_length))
    }

    pub fn contains(&self, file_address: u64) -> bool {
        self.get(file_address).is_some()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first_address(&self) -> Option<u64> {
        self.blocks.values().next().map(|b| b.address())
    }

    pub fn last_address(&self) -> Option<u64> {
        self.blocks.values().next_back().map(|b| b.address())
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.values().map(|b| b.address())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<Block>> + '_ {
        self.blocks.values()
    }

    /// Private mutable copy; readers of `self` are unaffected by its edits.
    pub fn begin_write(&self) -> BlockSetMut {
        BlockSetMut {
            file_length: self.file_length,
            blocks: (*self.blocks).clone(),
        }
    }
}

pub struct BlockSetMut {
    file_length: u64,
    blocks: BTreeMap<u64, Arc<Block>>,
}

impl BlockSetMut {
    pub fn get(&self, address: u64) -> Option<&Arc<Block>> {
        self.blocks.get(&(address / self.file_length))
    }

    pub fn add(&mut self, block: Arc<Block>) {
        self.blocks.insert(block.address() / self.file_length, block);
    }

    pub fn remove(&mut self, file_address: u64) -> Option<Arc<Block>> {
        self.blocks.remove(&(file_address / self.file_length))
    }

    /// Immutable copy of the current contents.
    pub fn snapshot(&self) -> BlockSet {
        BlockSet {
            file_length: self.file_length,
            blocks: Arc::new(self.blocks.clone()),
        }
    }

    pub fn end_write(self) -> BlockSet {
        BlockSet {
            file_length: self.file_length,
            blocks: Arc::new(self.blocks),
        }
    }
}
