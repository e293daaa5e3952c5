//! The tree of trees.
//!
//! The meta tree maps store names to store metadata and structure ids to the
//! root address of each store's tree. The two kinds of keys share one key
//! space and are told apart by their last byte:
//!
//! - store name: UTF-8 bytes followed by `0x00`
//! - structure id: minimal big-endian bytes, whose last byte is never zero
//!   because ids divisible by 256 are never allocated

pub mod recovery;
pub mod root;
pub mod structure_id;

use std::sync::Arc;

use crate::error::Result;
use crate::log::tip::LogTip;
use crate::log::varint;
use crate::log::{Log, LogWrite};
use crate::tree::{
    ExpiredLoggables, MutableTree, StoreConfig, StructureId, Tree, TreeLoader, NULL_ADDRESS,
};
use crate::Error;

use root::DatabaseRoot;
use structure_id::META_TREE_ID;

pub fn store_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub fn structure_key(id: StructureId) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(bytes.len() - 1);
    bytes[skip..].to_vec()
}

pub fn is_store_key(key: &[u8]) -> bool {
    key.last() == Some(&0)
}

/// What the meta tree records about a store under its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetadata {
    pub structure_id: StructureId,
    pub config: StoreConfig,
}

impl StoreMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.config.flags()];
        varint::encode(self.structure_id as u64, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&flags, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::DataCorruption("empty store metadata".to_string()))?;
        let (id, _) = varint::decode(rest)?;
        let structure_id = StructureId::try_from(id).map_err(|_| {
            Error::DataCorruption(format!("store structure id {} is out of range", id))
        })?;
        Ok(Self {
            structure_id,
            config: StoreConfig::from_flags(flags),
        })
    }
}

/// Immutable meta tree together with the database root that anchors it.
#[derive(Clone)]
pub struct MetaTree {
    tree: Arc<dyn Tree>,
    root: DatabaseRoot,
}

impl std::fmt::Debug for MetaTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTree")
            .field("root_address", &self.root.address())
            .field("tree_address", &self.root.tree_address())
            .field("size", &self.tree.size())
            .finish()
    }
}

impl MetaTree {
    pub fn new(tree: Arc<dyn Tree>, root: DatabaseRoot) -> Self {
        Self { tree, root }
    }

    /// Writes an empty meta tree and its database root into an empty log.
    pub fn create(log: &Log, loader: &dyn TreeLoader) -> Result<Self> {
        let mut meta = MutableMetaTree::new(loader.create(META_TREE_ID).as_ref());
        let mut session = log.begin_write()?;
        let saved = meta.save(&mut session, META_TREE_ID)?;
        session.end_write()?;
        tracing::info!(root = saved.root.address(), "Created empty database");
        Ok(Self::new(saved.tree, saved.root))
    }

    /// Loads the meta tree a database root points at.
    pub fn load(log: &Log, tip: &LogTip, loader: &dyn TreeLoader, root: DatabaseRoot) -> Result<Self> {
        if !root.is_valid() {
            return Err(Error::DataCorruption(format!(
                "database root at {} has a bad checksum",
                root.address()
            )));
        }
        let tree = loader.load(log, tip, META_TREE_ID, root.tree_address())?;
        Ok(Self::new(tree, root))
    }

    /// Address of the database root loggable.
    pub fn root_address(&self) -> u64 {
        self.root.address()
    }

    pub fn database_root(&self) -> &DatabaseRoot {
        &self.root
    }

    pub fn tree(&self) -> &Arc<dyn Tree> {
        &self.tree
    }

    pub fn last_structure_id(&self) -> Result<StructureId> {
        self.root.last_structure_id()
    }

    pub fn store(&self, name: &str) -> Result<Option<StoreMetadata>> {
        self.tree
            .get(&store_key(name))?
            .map(|bytes| StoreMetadata::decode(&bytes))
            .transpose()
    }

    /// Root of a store's tree, or [`NULL_ADDRESS`] if it was never saved.
    pub fn store_root(&self, structure_id: StructureId) -> Result<u64> {
        match self.tree.get(&structure_key(structure_id))? {
            Some(bytes) => Ok(varint::decode(&bytes)?.0),
            None => Ok(NULL_ADDRESS),
        }
    }

    pub fn stores(&self) -> Result<Vec<(String, StoreMetadata)>> {
        let mut stores = Vec::new();
        for (key, value) in self.tree.cursor()? {
            if !is_store_key(&key) {
                continue;
            }
            let name = String::from_utf8(key[..key.len() - 1].to_vec())
                .map_err(|_| Error::DataCorruption("store name is not valid UTF-8".to_string()))?;
            stores.push((name, StoreMetadata::decode(&value)?));
        }
        Ok(stores)
    }

    pub fn store_names(&self) -> Result<Vec<String>> {
        Ok(self.stores()?.into_iter().map(|(name, _)| name).collect())
    }

    pub fn open_tree(
        &self,
        log: &Log,
        tip: &LogTip,
        loader: &dyn TreeLoader,
        structure_id: StructureId,
    ) -> Result<Arc<dyn Tree>> {
        loader.load(log, tip, structure_id, self.store_root(structure_id)?)
    }

    /// Loads every store tree, failing on the first unreadable one.
    pub fn verify_stores(&self, log: &Log, tip: &LogTip, loader: &dyn TreeLoader) -> Result<()> {
        for (_, meta) in self.stores()? {
            self.open_tree(log, tip, loader, meta.structure_id)?;
        }
        Ok(())
    }

    pub fn mutable_copy(&self) -> MutableMetaTree {
        MutableMetaTree::new(self.tree.as_ref())
    }
}

/// Result of saving a meta tree.
pub struct SavedMetaTree {
    pub root: DatabaseRoot,
    pub tree: Arc<dyn Tree>,
    pub expired: ExpiredLoggables,
}

/// Writable copy of the meta tree used by one commit.
#[derive(Debug)]
pub struct MutableMetaTree {
    tree: Box<dyn MutableTree>,
}

impl MutableMetaTree {
    fn new(tree: &dyn Tree) -> Self {
        Self {
            tree: tree.mutable_copy(),
        }
    }

    pub fn add_store(&mut self, name: &str, meta: StoreMetadata) -> Result<()> {
        self.tree.put(&store_key(name), &meta.encode())?;
        Ok(())
    }

    pub fn remove_store(&mut self, name: &str, structure_id: StructureId) -> Result<()> {
        self.tree.delete(&store_key(name))?;
        self.tree.delete(&structure_key(structure_id))?;
        Ok(())
    }

    pub fn set_store_root(&mut self, structure_id: StructureId, root_address: u64) -> Result<()> {
        let mut value = Vec::new();
        varint::encode(root_address, &mut value);
        self.tree.put(&structure_key(structure_id), &value)?;
        Ok(())
    }

    /// Appends the meta tree and a database root referencing it.
    pub fn save(
        &mut self,
        log: &mut LogWrite<'_>,
        last_structure_id: StructureId,
    ) -> Result<SavedMetaTree> {
        let tree_address = self.tree.save(log)?;
        let root = DatabaseRoot::new(tree_address, last_structure_id).write(META_TREE_ID, log)?;
        Ok(SavedMetaTree {
            root,
            tree: self.tree.snapshot(),
            expired: self.tree.expired_loggables(),
        })
    }
}
