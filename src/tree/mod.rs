//! Tree capability consumed by the meta tree and the store layer.
//!
//! A [`Tree`] is an immutable snapshot rooted at a log address. Writes go to a
//! [`MutableTree`] obtained with [`Tree::mutable_copy`]; saving it appends the
//! changed loggables through a write session and yields the new root address.

pub mod flat;

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;
use crate::log::tip::LogTip;
use crate::log::{Log, LogWrite};

/// Root address of a tree that has never been saved.
pub const NULL_ADDRESS: u64 = u64::MAX;

pub type StructureId = u32;

pub type TreeCursor<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

const DUPLICATES_FLAG: u8 = 0x01;
const PREFIXING_FLAG: u8 = 0x02;

/// Persisted store flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreConfig {
    pub duplicates: bool,
    pub prefixing: bool,
}

impl StoreConfig {
    pub const WITHOUT_DUPLICATES: StoreConfig = StoreConfig {
        duplicates: false,
        prefixing: false,
    };

    pub const WITH_DUPLICATES: StoreConfig = StoreConfig {
        duplicates: true,
        prefixing: false,
    };

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.duplicates {
            flags |= DUPLICATES_FLAG;
        }
        if self.prefixing {
            flags |= PREFIXING_FLAG;
        }
        flags
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            duplicates: flags & DUPLICATES_FLAG != 0,
            prefixing: flags & PREFIXING_FLAG != 0,
        }
    }
}

/// Loggable ranges a commit made unreachable, as `(address, length)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredLoggables {
    entries: Vec<(u64, u64)>,
}

impl ExpiredLoggables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: u64, length: u64) {
        if address != NULL_ADDRESS {
            self.entries.push((address, length));
        }
    }

    pub fn extend(&mut self, other: ExpiredLoggables) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, u64)> + '_ {
        self.entries.iter()
    }

    pub fn total_length(&self) -> u64 {
        self.entries.iter().map(|(_, length)| length).sum()
    }
}

pub trait Tree: Debug + Send + Sync {
    fn structure_id(&self) -> StructureId;

    fn root_address(&self) -> u64;

    fn size(&self) -> u64;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Entries in key order.
    fn cursor(&self) -> Result<TreeCursor<'_>>;

    fn mutable_copy(&self) -> Box<dyn MutableTree>;

    /// Every loggable the tree is made of.
    fn loggables(&self) -> ExpiredLoggables;
}

pub trait MutableTree: Debug + Send {
    fn structure_id(&self) -> StructureId;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns false when the key already held exactly this value.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool>;

    /// Returns false when the key was absent.
    fn delete(&mut self, key: &[u8]) -> Result<bool>;

    fn size(&self) -> u64;

    fn cursor(&self) -> Result<TreeCursor<'_>>;

    fn is_dirty(&self) -> bool;

    /// Appends the tree to the log and returns its new root address.
    fn save(&mut self, log: &mut LogWrite<'_>) -> Result<u64>;

    /// Loggables superseded by the last save.
    fn expired_loggables(&self) -> ExpiredLoggables;

    /// Immutable view of the current contents, rooted where the last save put them.
    fn snapshot(&self) -> Arc<dyn Tree>;
}

/// Materializes trees from the log.
pub trait TreeLoader: Debug + Send + Sync {
    /// An empty tree that has never been saved.
    fn create(&self, structure_id: StructureId) -> Arc<dyn Tree>;

    /// Loads and fully checks the tree rooted at `root_address`.
    fn load(
        &self,
        log: &Log,
        tip: &LogTip,
        structure_id: StructureId,
        root_address: u64,
    ) -> Result<Arc<dyn Tree>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_flags() {
        for config in [
            StoreConfig::WITHOUT_DUPLICATES,
            StoreConfig::WITH_DUPLICATES,
            StoreConfig {
                duplicates: true,
                prefixing: true,
            },
        ] {
            assert_eq!(StoreConfig::from_flags(config.flags()), config);
        }
        assert_eq!(StoreConfig::default().flags(), 0);
    }

    #[test]
    fn test_expired_loggables_skip_null_address() {
        let mut expired = ExpiredLoggables::new();
        expired.add(NULL_ADDRESS, 10);
        expired.add(100, 20);
        expired.add(200, 5);
        assert_eq!(expired.len(), 2);
        assert_eq!(expired.total_length(), 25);
    }
}
