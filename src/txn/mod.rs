//! Snapshot transactions.
//!
//! A transaction reads through the meta tree it started with. Writes go to
//! copies of the touched store trees that only this transaction sees; a flush
//! publishes them if nobody committed in between, and otherwise reverts the
//! transaction onto the newest snapshot so the caller can replay its work.

pub mod dispatcher;
pub mod set;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::env::Environment;
use crate::error::Result;
use crate::meta::{MetaTree, StoreMetadata};
use crate::tree::{MutableTree, StoreConfig, StructureId, Tree};
use crate::Error;

use set::SnapshotKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ReadWrite,
    ReadOnly,
}

/// Runs after a commit installs its meta tree, while the commit lock is held.
/// An error makes the environment inoperative.
pub type CommitHook = Box<dyn FnOnce(&MetaTree) -> Result<()> + Send>;

/// Handle to a named store, valid in the transaction that opened it and in
/// later ones as long as the store is not removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    name: String,
    metadata: StoreMetadata,
}

impl Store {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure_id(&self) -> StructureId {
        self.metadata.structure_id
    }

    pub fn config(&self) -> StoreConfig {
        self.metadata.config
    }
}

pub struct Transaction<'env> {
    pub(crate) env: &'env Environment,
    pub(crate) id: u64,
    pub(crate) kind: TransactionKind,
    pub(crate) thread: ThreadId,
    pub(crate) meta: Arc<MetaTree>,
    pub(crate) snapshot: SnapshotKey,
    pub(crate) permits: usize,
    pub(crate) escalated: bool,
    pub(crate) mutable: BTreeMap<StructureId, Box<dyn MutableTree>>,
    pub(crate) created: BTreeMap<String, StoreMetadata>,
    pub(crate) removed: BTreeMap<String, (StoreMetadata, Arc<dyn Tree>)>,
    pub(crate) hooks: Vec<CommitHook>,
    replays: u32,
    started: Instant,
    finished: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("root", &self.meta.root_address())
            .field("permits", &self.permits)
            .field("replays", &self.replays)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(
        env: &'env Environment,
        id: u64,
        kind: TransactionKind,
        meta: Arc<MetaTree>,
        snapshot: SnapshotKey,
        permits: usize,
    ) -> Self {
        Self {
            env,
            id,
            kind,
            thread: thread::current().id(),
            meta,
            snapshot,
            permits,
            escalated: false,
            mutable: BTreeMap::new(),
            created: BTreeMap::new(),
            removed: BTreeMap::new(),
            hooks: Vec::new(),
            replays: 0,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_readonly(&self) -> bool {
        self.kind == TransactionKind::ReadOnly
    }

    pub fn is_exclusive(&self) -> bool {
        self.permits > 1 || self.permits == self.env.dispatcher(self.kind).available_permits()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of times the transaction was reverted onto a newer snapshot.
    pub fn replay_count(&self) -> u32 {
        self.replays
    }

    /// Root of the meta tree this transaction reads.
    pub fn root_address(&self) -> u64 {
        self.meta.root_address()
    }

    pub fn meta_tree(&self) -> &MetaTree {
        &self.meta
    }

    /// True when flushing would write nothing.
    pub fn is_idempotent(&self) -> bool {
        self.created.is_empty()
            && self.removed.is_empty()
            && self.mutable.values().all(|tree| !tree.is_dirty())
    }

    fn check_active(&self) -> Result<()> {
        if self.finished {
            return Err(Error::TransactionFinished);
        }
        self.env.check_operative()
    }

    fn check_writable(&self) -> Result<()> {
        self.check_active()?;
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn find_store(&self, name: &str) -> Result<Option<StoreMetadata>> {
        if let Some(metadata) = self.created.get(name) {
            return Ok(Some(*metadata));
        }
        if self.removed.contains_key(name) {
            return Ok(None);
        }
        self.meta.store(name)
    }

    /// Rejects handles to stores this transaction removed.
    fn check_store(&self, store: &Store) -> Result<()> {
        let removed = self
            .removed
            .get(&store.name)
            .is_some_and(|(metadata, _)| metadata.structure_id == store.structure_id());
        if removed {
            return Err(Error::StoreNotFound(store.name.clone()));
        }
        Ok(())
    }

    /// Opens a store, creating it with `config` if it does not exist.
    pub fn open_store(&mut self, name: &str, config: StoreConfig) -> Result<Store> {
        self.check_active()?;
        if let Some(metadata) = self.find_store(name)? {
            return Ok(Store {
                name: name.to_string(),
                metadata,
            });
        }
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }

        let structure_id = self.env.allocate_structure_id();
        let metadata = StoreMetadata {
            structure_id,
            config,
        };
        self.created.insert(name.to_string(), metadata);
        self.mutable
            .insert(structure_id, self.env.loader().create(structure_id).mutable_copy());
        tracing::debug!(txn = self.id, store = name, structure_id, "Created store");
        Ok(Store {
            name: name.to_string(),
            metadata,
        })
    }

    /// Looks up an existing store without creating it.
    pub fn get_store(&self, name: &str) -> Result<Store> {
        self.check_active()?;
        let metadata = self
            .find_store(name)?
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))?;
        Ok(Store {
            name: name.to_string(),
            metadata,
        })
    }

    pub fn store_exists(&self, name: &str) -> Result<bool> {
        self.check_active()?;
        Ok(self.find_store(name)?.is_some())
    }

    pub fn remove_store(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(metadata) = self.created.remove(name) {
            self.mutable.remove(&metadata.structure_id);
            return Ok(());
        }
        let metadata = self
            .find_store(name)?
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))?;
        let tree = self.env.open_immutable_tree(&self.meta, metadata.structure_id)?;
        self.mutable.remove(&metadata.structure_id);
        self.removed.insert(name.to_string(), (metadata, tree));
        tracing::debug!(txn = self.id, store = name, "Removed store");
        Ok(())
    }

    /// Store names visible to this transaction, in order.
    pub fn store_names(&self) -> Result<Vec<String>> {
        self.check_active()?;
        let mut names: Vec<String> = self
            .meta
            .store_names()?
            .into_iter()
            .filter(|name| !self.removed.contains_key(name))
            .collect();
        names.extend(self.created.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Writable copy of a store's tree, made on first use.
    pub fn mutable_tree(&mut self, store: &Store) -> Result<&mut dyn MutableTree> {
        self.check_writable()?;
        self.check_store(store)?;
        let structure_id = store.structure_id();
        if !self.mutable.contains_key(&structure_id) {
            let tree = self.env.open_immutable_tree(&self.meta, structure_id)?;
            self.mutable.insert(structure_id, tree.mutable_copy());
        }
        match self.mutable.get_mut(&structure_id) {
            Some(tree) => Ok(tree.as_mut()),
            None => Err(Error::StoreNotFound(store.name.clone())),
        }
    }

    pub fn get(&self, store: &Store, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        self.check_store(store)?;
        match self.mutable.get(&store.structure_id()) {
            Some(tree) => tree.get(key),
            None => self
                .env
                .open_immutable_tree(&self.meta, store.structure_id())?
                .get(key),
        }
    }

    /// Returns false when the key already held this value.
    pub fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> Result<bool> {
        self.mutable_tree(store)?.put(key, value)
    }

    /// Returns false when the key was absent.
    pub fn delete(&mut self, store: &Store, key: &[u8]) -> Result<bool> {
        self.mutable_tree(store)?.delete(key)
    }

    /// Every entry of the store in key order.
    pub fn entries(&self, store: &Store) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_active()?;
        self.check_store(store)?;
        match self.mutable.get(&store.structure_id()) {
            Some(tree) => Ok(tree.cursor()?.collect()),
            None => {
                let tree = self.env.open_immutable_tree(&self.meta, store.structure_id())?;
                let entries = tree.cursor()?.collect();
                Ok(entries)
            }
        }
    }

    pub fn store_size(&self, store: &Store) -> Result<u64> {
        self.check_active()?;
        self.check_store(store)?;
        match self.mutable.get(&store.structure_id()) {
            Some(tree) => Ok(tree.size()),
            None => Ok(self
                .env
                .open_immutable_tree(&self.meta, store.structure_id())?
                .size()),
        }
    }

    /// Registers a hook run when this transaction's next flush installs its
    /// meta tree. Hooks are dropped on revert.
    pub fn on_commit<F>(&mut self, hook: F) -> Result<()>
    where
        F: FnOnce(&MetaTree) -> Result<()> + Send + 'static,
    {
        self.check_writable()?;
        self.hooks.push(Box::new(hook));
        Ok(())
    }

    /// Publishes the changes made so far and keeps the transaction open.
    ///
    /// Returns false when another transaction committed since this one's
    /// snapshot; the transaction has then been reverted onto the newest
    /// snapshot and its changes discarded.
    pub fn flush(&mut self) -> Result<bool> {
        self.check_active()?;
        if self.is_readonly() {
            return Ok(true);
        }
        let env = self.env;
        if env.flush_transaction(self)? {
            if self.escalated {
                self.permits = env.dispatcher(self.kind).downgrade(self.thread, self.permits)?;
                self.escalated = false;
            }
            return Ok(true);
        }
        self.replay()?;
        Ok(false)
    }

    /// Flushes and finishes. On false the transaction stays open, reverted
    /// onto the newest snapshot.
    pub fn commit(&mut self) -> Result<bool> {
        if !self.flush()? {
            return Ok(false);
        }
        self.finish()?;
        Ok(true)
    }

    /// Discards the changes and finishes.
    pub fn abort(&mut self) -> Result<()> {
        self.finish()
    }

    /// Discards the changes and moves onto the newest snapshot.
    pub fn revert(&mut self) -> Result<()> {
        self.check_active()?;
        self.mutable.clear();
        self.created.clear();
        self.removed.clear();
        self.hooks.clear();

        let meta = self.env.meta_tree();
        self.snapshot = self
            .env
            .transactions()
            .rebase(&self.snapshot, meta.root_address(), self.id);
        self.meta = meta;
        Ok(())
    }

    /// Reverts after a lost race, escalating to an exclusive transaction once
    /// the replay budget is spent.
    fn replay(&mut self) -> Result<()> {
        self.replays += 1;
        let config = self.env.config();
        let exhausted = self.replays >= config.txn_replay_max_count
            || self.started.elapsed() >= config.txn_replay_timeout;
        if exhausted && !self.is_exclusive() {
            let dispatcher = self.env.dispatcher(self.kind);
            dispatcher.release(self.thread, self.permits)?;
            self.permits = 0;
            self.permits = dispatcher.acquire_exclusive(self.thread)?;
            self.escalated = self.permits > 1;
            tracing::debug!(
                txn = self.id,
                replays = self.replays,
                permits = self.permits,
                "Escalated transaction to exclusive"
            );
        }
        self.revert()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::TransactionFinished);
        }
        if thread::current().id() != self.thread {
            return Err(Error::WrongThread);
        }
        self.env.threads().check_innermost(self.thread, self.id)?;
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.mutable.clear();
        self.hooks.clear();
        self.env.transactions().remove(&self.snapshot);
        self.env.threads().remove(self.thread, self.id)?;
        if self.permits > 0 {
            self.env.dispatcher(self.kind).release(self.thread, self.permits)?;
            self.permits = 0;
        }
        self.env.run_ready_tasks()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(txn = self.id, error = %e, "Failed to release transaction");
        }
    }
}
