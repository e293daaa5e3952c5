//! Copy-on-write sorted map persisted as a flat run of loggables.
//!
//! Saving writes the entries in key order, split into chunk loggables of
//! roughly [`CHUNK_TARGET`] bytes, followed by a root loggable. A chunk never
//! outgrows what one log file can hold:
//!
//! ```text
//! root:  [entry_count: varint][chunk_count: varint][chunk_address: varint]*
//! chunk: ([key_len: varint][key][value_len: varint][value])*
//! ```
//!
//! Every save rewrites the whole tree, so all loggables of the previous
//! version expire.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    ExpiredLoggables, MutableTree, StructureId, Tree, TreeCursor, TreeLoader, NULL_ADDRESS,
};
use crate::error::Result;
use crate::log::tip::LogTip;
use crate::log::varint;
use crate::log::{Log, LogWrite};
use crate::Error;

pub const ROOT_TYPE: u8 = 2;
pub const CHUNK_TYPE: u8 = 3;
pub const CHUNK_TARGET: usize = 4096;

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
pub struct FlatTree {
    structure_id: StructureId,
    root_address: u64,
    entries: Arc<Entries>,
    loggables: Arc<[(u64, u64)]>,
}

impl std::fmt::Debug for FlatTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatTree")
            .field("structure_id", &self.structure_id)
            .field("root_address", &self.root_address)
            .field("size", &self.entries.len())
            .finish()
    }
}

impl FlatTree {
    pub fn empty(structure_id: StructureId) -> Self {
        Self {
            structure_id,
            root_address: NULL_ADDRESS,
            entries: Arc::new(BTreeMap::new()),
            loggables: Arc::from(Vec::new()),
        }
    }
}

impl Tree for FlatTree {
    fn structure_id(&self) -> StructureId {
        self.structure_id
    }

    fn root_address(&self) -> u64 {
        self.root_address
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn cursor(&self) -> Result<TreeCursor<'_>> {
        Ok(Box::new(
            self.entries.iter().map(|(k, v)| (k.clone(), v.clone())),
        ))
    }

    fn mutable_copy(&self) -> Box<dyn MutableTree> {
        Box::new(FlatMutableTree {
            structure_id: self.structure_id,
            root_address: self.root_address,
            entries: self.entries.clone(),
            loggables: self.loggables.clone(),
            dirty: false,
            expired: ExpiredLoggables::new(),
        })
    }

    fn loggables(&self) -> ExpiredLoggables {
        let mut all = ExpiredLoggables::new();
        for (address, length) in self.loggables.iter() {
            all.add(*address, *length);
        }
        all
    }
}

pub struct FlatMutableTree {
    structure_id: StructureId,
    root_address: u64,
    entries: Arc<Entries>,
    loggables: Arc<[(u64, u64)]>,
    dirty: bool,
    expired: ExpiredLoggables,
}

impl std::fmt::Debug for FlatMutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatMutableTree")
            .field("structure_id", &self.structure_id)
            .field("root_address", &self.root_address)
            .field("size", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl FlatMutableTree {
    /// Splits the entries into chunks of at most `limit` bytes. An entry
    /// larger than `limit` gets a chunk of its own.
    fn encode_chunks(&self, limit: usize) -> Vec<Vec<u8>> {
        let target = CHUNK_TARGET.min(limit);
        let mut chunks = Vec::new();
        let mut chunk = Vec::new();
        let mut entry = Vec::new();
        for (key, value) in self.entries.iter() {
            entry.clear();
            varint::encode(key.len() as u64, &mut entry);
            entry.extend_from_slice(key);
            varint::encode(value.len() as u64, &mut entry);
            entry.extend_from_slice(value);
            if !chunk.is_empty() && chunk.len() + entry.len() > limit {
                chunks.push(std::mem::take(&mut chunk));
            }
            chunk.extend_from_slice(&entry);
            if chunk.len() >= target {
                chunks.push(std::mem::take(&mut chunk));
            }
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        chunks
    }
}

impl MutableTree for FlatMutableTree {
    fn structure_id(&self) -> StructureId {
        self.structure_id
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.entries.get(key).is_some_and(|v| v.as_slice() == value) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.entries).insert(key.to_vec(), value.to_vec());
        self.dirty = true;
        Ok(true)
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.entries).remove(key);
        self.dirty = true;
        Ok(true)
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn cursor(&self) -> Result<TreeCursor<'_>> {
        Ok(Box::new(
            self.entries.iter().map(|(k, v)| (k.clone(), v.clone())),
        ))
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn save(&mut self, log: &mut LogWrite<'_>) -> Result<u64> {
        if !self.dirty && self.root_address != NULL_ADDRESS {
            return Ok(self.root_address);
        }
        let sid = self.structure_id as u64;

        let mut loggables = Vec::new();
        let mut root = Vec::new();
        varint::encode(self.entries.len() as u64, &mut root);
        let limit = usize::try_from(log.max_data_len(sid)).unwrap_or(usize::MAX);
        let chunks = self.encode_chunks(limit);
        varint::encode(chunks.len() as u64, &mut root);
        for chunk in &chunks {
            let address = log.write(CHUNK_TYPE, sid, chunk)?;
            loggables.push((address, log.position() - address));
            varint::encode(address, &mut root);
        }
        let root_address = log.write(ROOT_TYPE, sid, &root)?;
        loggables.push((root_address, log.position() - root_address));

        let mut expired = ExpiredLoggables::new();
        for (address, length) in self.loggables.iter() {
            expired.add(*address, *length);
        }
        self.expired = expired;
        self.loggables = Arc::from(loggables);
        self.root_address = root_address;
        self.dirty = false;
        Ok(root_address)
    }

    fn expired_loggables(&self) -> ExpiredLoggables {
        self.expired.clone()
    }

    fn snapshot(&self) -> Arc<dyn Tree> {
        Arc::new(FlatTree {
            structure_id: self.structure_id,
            root_address: self.root_address,
            entries: self.entries.clone(),
            loggables: self.loggables.clone(),
        })
    }
}

fn slice_at(bytes: &[u8], offset: usize, len: u64) -> Option<&[u8]> {
    let end = offset.checked_add(usize::try_from(len).ok()?)?;
    bytes.get(offset..end)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlatTreeLoader;

impl FlatTreeLoader {
    fn corrupt(root_address: u64, what: impl std::fmt::Display) -> Error {
        Error::DataCorruption(format!("tree rooted at {}: {}", root_address, what))
    }
}

impl TreeLoader for FlatTreeLoader {
    fn create(&self, structure_id: StructureId) -> Arc<dyn Tree> {
        Arc::new(FlatTree::empty(structure_id))
    }

    fn load(
        &self,
        log: &Log,
        tip: &LogTip,
        structure_id: StructureId,
        root_address: u64,
    ) -> Result<Arc<dyn Tree>> {
        if root_address == NULL_ADDRESS {
            return Ok(self.create(structure_id));
        }
        let root = log.read_expecting(tip, root_address, ROOT_TYPE)?;
        if root.structure_id() != structure_id as u64 {
            return Err(Self::corrupt(
                root_address,
                format!("belongs to structure {}", root.structure_id()),
            ));
        }

        let data = root.data();
        let (count, pos) = data.read_varint(0)?;
        let (chunk_count, mut pos) = data.read_varint(pos)?;

        let mut entries = Entries::new();
        let mut loggables = Vec::with_capacity(chunk_count as usize + 1);
        for _ in 0..chunk_count {
            let (address, next) = data.read_varint(pos)?;
            pos = next;
            let chunk = log.read_expecting(tip, address, CHUNK_TYPE)?;
            if chunk.structure_id() != structure_id as u64 {
                return Err(Self::corrupt(root_address, "chunk of another structure"));
            }
            loggables.push((address, chunk.length()));

            let bytes = chunk.data().to_vec();
            let mut offset = 0;
            while offset < bytes.len() {
                let (key_len, n) = varint::decode(&bytes[offset..])?;
                offset += n;
                let key = slice_at(&bytes, offset, key_len)
                    .ok_or_else(|| Self::corrupt(root_address, "truncated key"))?
                    .to_vec();
                offset += key_len as usize;
                let (value_len, n) = varint::decode(&bytes[offset..])?;
                offset += n;
                let value = slice_at(&bytes, offset, value_len)
                    .ok_or_else(|| Self::corrupt(root_address, "truncated value"))?
                    .to_vec();
                offset += value_len as usize;

                if entries.keys().next_back().is_some_and(|last| *last >= key) {
                    return Err(Self::corrupt(root_address, "keys out of order"));
                }
                entries.insert(key, value);
            }
        }
        if entries.len() as u64 != count {
            return Err(Self::corrupt(
                root_address,
                format!("expected {} entries, found {}", count, entries.len()),
            ));
        }
        loggables.push((root_address, root.length()));

        Ok(Arc::new(FlatTree {
            structure_id,
            root_address,
            entries: Arc::new(entries),
            loggables: Arc::from(loggables),
        }))
    }
}
