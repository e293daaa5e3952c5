//! The environment ties the log, the meta tree and transactions together.
//!
//! # Commit protocol
//!
//! Writers are serialized by one commit lock. Under it a flush checks that the
//! transaction's snapshot is still the current meta tree, appends the dirty
//! store trees, the new meta tree and a database root in one log write
//! session, ends the session and swaps the new meta tree in. Readers only take
//! the meta lock long enough to clone the current pointer.
//!
//! Until the session ends nothing is visible and a failure rolls the log back.
//! Once it has ended the bytes are part of the database; a failure after that
//! point leaves the environment inoperative.

pub mod state;
pub mod tasks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crate::config::EnvironmentConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::gc::GcHooks;
use crate::log::Log;
use crate::meta::recovery::Recoverer;
use crate::meta::structure_id::StructureIdAllocator;
use crate::meta::MetaTree;
use crate::scheduler::Scheduler;
use crate::tree::flat::FlatTreeLoader;
use crate::tree::{ExpiredLoggables, StructureId, Tree, TreeLoader, NULL_ADDRESS};
use crate::txn::dispatcher::TransactionDispatcher;
use crate::txn::set::{SnapshotInfo, TransactionSet};
use crate::txn::{Transaction, TransactionKind};
use crate::Error;

use state::{DeferredTasks, EnvState, SafeTask, ThreadTransactions};
use tasks::{LogSyncTask, StuckTransactionMonitor};

pub struct Environment {
    config: EnvironmentConfig,
    log: Arc<Log>,
    loader: Arc<dyn TreeLoader>,
    meta: RwLock<Arc<MetaTree>>,
    commit_lock: Mutex<()>,
    read_write: TransactionDispatcher,
    read_only: TransactionDispatcher,
    txns: Arc<TransactionSet>,
    structure_ids: StructureIdAllocator,
    trees: Mutex<HashMap<StructureId, Arc<dyn Tree>>>,
    state: Mutex<EnvState>,
    threads: ThreadTransactions,
    deferred: DeferredTasks,
    gc: RwLock<Option<Arc<dyn GcHooks>>>,
    next_txn_id: AtomicU64,
    scheduler: Mutex<Option<Scheduler>>,
    _lock: DirLock,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("dir", &self.config.log.dir)
            .field("root", &self.meta_tree().root_address())
            .field("transactions", &self.txns.len())
            .finish()
    }
}

impl Environment {
    /// Opens or creates the environment in `config.log.dir`.
    pub fn open(config: EnvironmentConfig) -> Result<Self> {
        Self::open_with_loader(config, Arc::new(FlatTreeLoader))
    }

    pub fn open_with_loader(config: EnvironmentConfig, loader: Arc<dyn TreeLoader>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.log.dir)?;
        let lock = DirLock::acquire(&config.log.dir)?;

        let log = Arc::new(Log::open(config.log.clone())?);
        let recovery = Recoverer::new(&log, loader.as_ref()).recover()?;
        let meta = match recovery.meta {
            Some(meta) => meta,
            None => MetaTree::create(&log, loader.as_ref())?,
        };
        log.write_startup(meta.root_address(), false)?;

        let txns = Arc::new(TransactionSet::new());
        let scheduler = Scheduler::new("cinder-background")?;
        if let Some(timeout) = config.txn_timeout {
            scheduler.register(Arc::new(StuckTransactionMonitor::new(
                txns.clone(),
                timeout,
                config.txn_monitor_interval,
            )))?;
        }
        if let Some(period) = config.log_sync_period {
            scheduler.register(Arc::new(LogSyncTask::new(log.clone(), period)))?;
        }

        tracing::info!(
            dir = %config.log.dir.display(),
            root = meta.root_address(),
            discarded = recovery.discarded,
            "Opened environment"
        );

        Ok(Self {
            structure_ids: StructureIdAllocator::new(meta.last_structure_id()?),
            read_write: TransactionDispatcher::new(config.max_read_write_txns)?,
            read_only: TransactionDispatcher::new(config.max_readonly_txns)?,
            meta: RwLock::new(Arc::new(meta)),
            commit_lock: Mutex::new(()),
            txns,
            trees: Mutex::new(HashMap::new()),
            state: Mutex::new(EnvState::Operative),
            threads: ThreadTransactions::default(),
            deferred: DeferredTasks::default(),
            gc: RwLock::new(None),
            next_txn_id: AtomicU64::new(0),
            scheduler: Mutex::new(Some(scheduler)),
            loader,
            log,
            config,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub(crate) fn loader(&self) -> &dyn TreeLoader {
        self.loader.as_ref()
    }

    pub(crate) fn transactions(&self) -> &TransactionSet {
        &self.txns
    }

    pub(crate) fn threads(&self) -> &ThreadTransactions {
        &self.threads
    }

    pub(crate) fn dispatcher(&self, kind: TransactionKind) -> &TransactionDispatcher {
        match kind {
            TransactionKind::ReadWrite => &self.read_write,
            TransactionKind::ReadOnly => &self.read_only,
        }
    }

    pub(crate) fn allocate_structure_id(&self) -> StructureId {
        self.structure_ids.allocate()
    }

    pub fn last_structure_id(&self) -> StructureId {
        self.structure_ids.last()
    }

    /// The current meta tree.
    pub fn meta_tree(&self) -> Arc<MetaTree> {
        match self.meta.read() {
            Ok(meta) => meta.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> EnvState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_operative(&self) -> bool {
        self.state() == EnvState::Operative
    }

    pub(crate) fn check_operative(&self) -> Result<()> {
        self.state.lock()?.check()
    }

    fn set_inoperative(&self, reason: String) {
        tracing::error!(reason = %reason, "Environment is now inoperative");
        match self.state.lock() {
            Ok(mut state) => *state = EnvState::Inoperative(reason),
            Err(poisoned) => *poisoned.into_inner() = EnvState::Inoperative(reason),
        }
    }

    /// Number of open transactions.
    pub fn transaction_count(&self) -> usize {
        self.txns.len()
    }

    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        self.begin(TransactionKind::ReadWrite, false, None)
    }

    pub fn begin_exclusive_transaction(&self) -> Result<Transaction<'_>> {
        self.begin(TransactionKind::ReadWrite, true, None)
    }

    pub fn begin_readonly_transaction(&self) -> Result<Transaction<'_>> {
        self.begin(TransactionKind::ReadOnly, false, None)
    }

    /// Exclusive transaction for the garbage collector. Gives up with
    /// [`Error::TransactionAcquireTimeout`] instead of blocking foreground work.
    pub fn begin_gc_transaction(&self) -> Result<Transaction<'_>> {
        self.begin(
            TransactionKind::ReadWrite,
            true,
            Some(self.config.gc_txn_acquire_timeout),
        )
    }

    fn begin(
        &self,
        kind: TransactionKind,
        exclusive: bool,
        timeout: Option<std::time::Duration>,
    ) -> Result<Transaction<'_>> {
        self.check_operative()?;
        let thread = thread::current().id();
        let dispatcher = self.dispatcher(kind);
        let permits = match (exclusive, timeout) {
            (false, _) => dispatcher.acquire(thread)?,
            (true, None) => dispatcher.acquire_exclusive(thread)?,
            (true, Some(timeout)) => dispatcher.try_acquire_exclusive(thread, timeout)?,
        };

        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = self.meta_tree();
        let snapshot = self.txns.add(meta.root_address(), SnapshotInfo::new(id));
        // from here on dropping the transaction gives everything back
        let txn = Transaction::new(self, id, kind, meta, snapshot, permits);
        self.threads.push(thread, id)?;
        self.check_operative()?;
        tracing::trace!(txn = id, kind = ?kind, permits, "Began transaction");
        Ok(txn)
    }

    /// Runs `body` in a read-write transaction, replaying it until it commits.
    pub fn execute_in_transaction<F>(&self, mut body: F) -> Result<()>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<()>,
    {
        self.compute_in_transaction(|txn| body(txn))
    }

    pub fn compute_in_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin_transaction()?;
        Self::run_until_committed(&mut txn, body)
    }

    pub fn execute_in_exclusive_transaction<F>(&self, body: F) -> Result<()>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<()>,
    {
        let mut txn = self.begin_exclusive_transaction()?;
        Self::run_until_committed(&mut txn, body)
    }

    pub fn compute_in_readonly_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin_readonly_transaction()?;
        let value = body(&mut txn)?;
        txn.abort()?;
        Ok(value)
    }

    fn run_until_committed<T, F>(txn: &mut Transaction<'_>, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        loop {
            let value = body(txn)?;
            if txn.commit()? {
                return Ok(value);
            }
            tracing::debug!(txn = txn.id(), replays = txn.replay_count(), "Replaying transaction");
        }
    }

    /// Tree of a store as of `meta`.
    pub fn open_immutable_tree(&self, meta: &MetaTree, structure_id: StructureId) -> Result<Arc<dyn Tree>> {
        let root = meta.store_root(structure_id)?;
        if root == NULL_ADDRESS {
            return Ok(self.loader.create(structure_id));
        }
        if let Some(tree) = self.trees.lock()?.get(&structure_id) {
            if tree.root_address() == root {
                return Ok(tree.clone());
            }
        }

        let tree = self
            .loader
            .load(&self.log, &self.log.tip(), structure_id, root)?;
        let mut trees = self.trees.lock()?;
        let newer = trees
            .get(&structure_id)
            .map_or(true, |cached| cached.root_address() < root);
        if newer {
            trees.insert(structure_id, tree.clone());
        }
        Ok(tree)
    }

    /// Commits the changes of `txn` if its snapshot is still current.
    pub(crate) fn flush_transaction(&self, txn: &mut Transaction<'_>) -> Result<bool> {
        self.check_operative()?;
        if txn.is_idempotent() {
            return Ok(true);
        }

        let (installed, expired) = {
            let _commit = self.commit_lock.lock()?;
            let current = self.meta_tree();
            if current.root_address() != txn.meta.root_address() {
                tracing::debug!(
                    txn = txn.id(),
                    snapshot = txn.meta.root_address(),
                    current = current.root_address(),
                    "Snapshot is stale"
                );
                return Ok(false);
            }

            let mut meta = current.mutable_copy();
            let mut expired = ExpiredLoggables::new();
            let mut saved_trees = Vec::new();

            let mut session = self.log.begin_write()?;
            let initial = session.initial_tip().clone();

            for (name, (store, tree)) in &txn.removed {
                meta.remove_store(name, store.structure_id)?;
                expired.extend(tree.loggables());
            }
            for (name, store) in &txn.created {
                meta.add_store(name, *store)?;
            }
            for (structure_id, tree) in txn.mutable.iter_mut() {
                let created = txn
                    .created
                    .values()
                    .any(|store| store.structure_id == *structure_id);
                if !tree.is_dirty() && !created {
                    continue;
                }
                let root = tree.save(&mut session)?;
                meta.set_store_root(*structure_id, root)?;
                expired.extend(tree.expired_loggables());
                saved_trees.push(tree.snapshot());
            }
            let saved = meta.save(&mut session, self.structure_ids.last())?;
            expired.extend(saved.expired);
            expired.add(current.root_address(), current.database_root().length());

            if let Err(e) = session.end_write() {
                if !Arc::ptr_eq(&self.log.tip(), &initial) {
                    self.set_inoperative(format!("log write failed after publishing: {}", e));
                }
                return Err(e);
            }

            let next = Arc::new(MetaTree::new(saved.tree, saved.root));
            if let Err(e) = self.install(txn, next.clone(), saved_trees) {
                self.set_inoperative(format!("commit failed after the log write: {}", e));
                return Err(e);
            }
            (next, expired)
        };

        txn.snapshot = self
            .txns
            .rebase(&txn.snapshot, installed.root_address(), txn.id());
        txn.meta = installed;
        txn.mutable.clear();
        txn.created.clear();
        txn.removed.clear();

        tracing::debug!(
            txn = txn.id(),
            root = txn.meta.root_address(),
            expired = expired.len(),
            "Committed transaction"
        );
        if let Some(gc) = self.gc_hooks() {
            gc.fetch_expired_loggables(expired);
        }
        Ok(true)
    }

    fn install(
        &self,
        txn: &mut Transaction<'_>,
        next: Arc<MetaTree>,
        saved_trees: Vec<Arc<dyn Tree>>,
    ) -> Result<()> {
        *self.meta.write()? = next.clone();
        {
            let mut trees = self.trees.lock()?;
            for (store, _) in txn.removed.values() {
                trees.remove(&store.structure_id);
            }
            for tree in saved_trees {
                trees.insert(tree.structure_id(), tree);
            }
        }
        for hook in txn.hooks.drain(..) {
            hook(next.as_ref())?;
        }
        Ok(())
    }

    pub fn set_gc_hooks(&self, hooks: Arc<dyn GcHooks>) -> Result<()> {
        *self.gc.write()? = Some(hooks);
        Ok(())
    }

    fn gc_hooks(&self) -> Option<Arc<dyn GcHooks>> {
        match self.gc.read() {
            Ok(gc) => gc.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn suspend_gc(&self) {
        if let Some(gc) = self.gc_hooks() {
            gc.suspend();
        }
    }

    pub fn resume_gc(&self) {
        if let Some(gc) = self.gc_hooks() {
            gc.resume();
        }
    }

    /// Oldest meta tree root some open transaction may still read.
    pub fn oldest_snapshot_root(&self) -> u64 {
        let current = self.meta_tree().root_address();
        self.txns.oldest_root().map_or(current, |oldest| oldest.min(current))
    }

    /// Hides files from new readers; their bytes stay on disk.
    pub fn forget_files(&self, addresses: &[u64]) -> Result<()> {
        self.check_operative()?;
        self.log.forget_files(addresses)
    }

    /// Forgets the files now and deletes them once every transaction that
    /// might still read them has finished.
    pub fn remove_files(&self, addresses: Vec<u64>) -> Result<()> {
        self.forget_files(&addresses)?;
        let log = self.log.clone();
        self.run_transaction_safe_task(Box::new(move || {
            for address in addresses {
                if let Err(e) = log.remove_file(address) {
                    tracing::error!(address, error = %e, "Failed to remove log file");
                }
            }
        }))
    }

    /// Runs `task` once all transactions open right now have finished.
    pub fn run_transaction_safe_task(&self, task: SafeTask) -> Result<()> {
        self.deferred.push(self.txns.next_id(), task)?;
        self.run_ready_tasks()
    }

    pub(crate) fn run_ready_tasks(&self) -> Result<()> {
        for task in self.deferred.take_ready(self.txns.oldest_id())? {
            task();
        }
        Ok(())
    }

    /// Records a clean shutdown and stops background work. Fails while
    /// transactions are open unless `close_forcedly` is set.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if *state == EnvState::Closed {
            return Ok(());
        }
        let open = self.txns.len();
        if open > 0 {
            if !self.config.close_forcedly {
                return Err(Error::InvalidState(format!(
                    "{} transactions are still open",
                    open
                )));
            }
            tracing::warn!(open, "Closing environment with open transactions");
        }

        if let Some(scheduler) = self.scheduler.lock()?.take() {
            scheduler.shutdown()?;
        }
        if *state == EnvState::Operative {
            self.log.write_startup(self.meta_tree().root_address(), true)?;
        }
        self.log.close()?;
        *state = EnvState::Closed;
        drop(state);

        for task in self.deferred.take_ready(None)? {
            task();
        }
        tracing::info!(dir = %self.config.log.dir.display(), "Closed environment");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Failed to close environment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::UtilizationTracker;
    use crate::log::cipher::Cipher;
    use crate::tree::StoreConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EnvironmentConfig {
        EnvironmentConfig::new(dir.path())
            .page_size(1024)
            .file_length(64 * 1024)
            .log_sync_period(None)
    }

    fn put(env: &Environment, store: &str, key: &[u8], value: &[u8]) -> Result<()> {
        env.execute_in_transaction(|txn| {
            let store = txn.open_store(store, StoreConfig::default())?;
            txn.put(&store, key, value)?;
            Ok(())
        })
    }

    fn get(env: &Environment, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        env.compute_in_readonly_transaction(|txn| {
            if !txn.store_exists(store)? {
                return Ok(None);
            }
            let store = txn.get_store(store)?;
            txn.get(&store, key)
        })
    }

    #[test]
    fn test_empty_environment_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let root = {
            let env = Environment::open(config(&dir))?;
            let meta = env.meta_tree();
            assert!(meta.store_names()?.is_empty());
            env.close()?;
            meta.root_address()
        };

        let env = Environment::open(config(&dir))?;
        assert_eq!(env.meta_tree().root_address(), root);
        assert!(env.meta_tree().store_names()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_committed_data_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let env = Environment::open(config(&dir))?;
            put(&env, "users", b"alice", b"1")?;
            put(&env, "users", b"bob", b"2")?;
            put(&env, "orders", b"o-1", b"alice")?;
        }

        let env = Environment::open(config(&dir))?;
        assert_eq!(get(&env, "users", b"alice")?, Some(b"1".to_vec()));
        assert_eq!(get(&env, "users", b"bob")?, Some(b"2".to_vec()));
        assert_eq!(get(&env, "orders", b"o-1")?, Some(b"alice".to_vec()));

        let mut txn = env.begin_readonly_transaction()?;
        assert_eq!(txn.store_names()?, vec!["orders".to_string(), "users".to_string()]);
        let users = txn.get_store("users")?;
        assert_eq!(txn.store_size(&users)?, 2);
        txn.abort()?;

        // new ids continue after the recovered ones
        let last = env.last_structure_id();
        put(&env, "audit", b"k", b"v")?;
        assert!(env.last_structure_id() > last);
        Ok(())
    }

    #[test]
    fn test_reader_keeps_its_snapshot() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        put(&env, "s", b"key", b"old")?;

        let mut reader = env.begin_readonly_transaction()?;
        let store = reader.get_store("s")?;
        assert_eq!(reader.get(&store, b"key")?, Some(b"old".to_vec()));

        thread::scope(|scope| {
            scope
                .spawn(|| -> Result<()> {
                    put(&env, "s", b"key", b"new")?;
                    put(&env, "s", b"other", b"x")
                })
                .join()
                .unwrap()
        })?;

        assert_eq!(reader.get(&store, b"key")?, Some(b"old".to_vec()));
        assert_eq!(reader.get(&store, b"other")?, None);
        assert_eq!(reader.entries(&store)?.len(), 1);
        reader.abort()?;

        assert_eq!(get(&env, "s", b"key")?, Some(b"new".to_vec()));
        Ok(())
    }

    #[test]
    fn test_concurrent_commits_install_increasing_roots() -> Result<()> {
        const THREADS: usize = 4;
        const COMMITS: usize = 10;
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        let roots = Arc::new(Mutex::new(Vec::new()));
        let replays = AtomicUsize::new(0);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let env = &env;
                    let roots = roots.clone();
                    let replays = &replays;
                    scope.spawn(move || -> Result<()> {
                        for i in 0..COMMITS {
                            let mut attempts = 0;
                            env.execute_in_transaction(|txn| {
                                attempts += 1;
                                let store = txn.open_store("counters", StoreConfig::default())?;
                                let key = format!("t{}-{}", t, i);
                                txn.put(&store, key.as_bytes(), b"1")?;
                                let roots = roots.clone();
                                txn.on_commit(move |meta| {
                                    roots.lock()?.push(meta.root_address());
                                    Ok(())
                                })
                            })?;
                            replays.fetch_add(attempts - 1, Ordering::SeqCst);
                        }
                        Ok(())
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap()?;
            }
            Ok::<(), Error>(())
        })?;

        let roots = roots.lock()?.clone();
        assert_eq!(roots.len(), THREADS * COMMITS);
        assert!(roots.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(env.meta_tree().root_address(), *roots.last().unwrap());

        let count = env.compute_in_readonly_transaction(|txn| {
            let store = txn.get_store("counters")?;
            txn.store_size(&store)
        })?;
        assert_eq!(count as usize, THREADS * COMMITS);
        Ok(())
    }

    #[test]
    fn test_stale_flush_replays_and_escalates() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir).txn_replay_max_count(1))?;
        put(&env, "s", b"a", b"1")?;

        let mut txn = env.begin_transaction()?;
        let store = txn.get_store("s")?;
        txn.put(&store, b"b", b"2")?;

        thread::scope(|scope| scope.spawn(|| put(&env, "s", b"c", b"3")).join().unwrap())?;

        assert!(!txn.flush()?);
        assert_eq!(txn.replay_count(), 1);
        assert!(txn.is_exclusive());
        // reverted onto the newest snapshot, pending write discarded
        assert_eq!(txn.get(&store, b"c")?, Some(b"3".to_vec()));
        assert_eq!(txn.get(&store, b"b")?, None);

        txn.put(&store, b"b", b"2")?;
        assert!(txn.flush()?);
        assert!(!txn.is_exclusive());
        txn.abort()?;

        assert_eq!(get(&env, "s", b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_store_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        put(&env, "doomed", b"k", b"v")?;

        let mut txn = env.begin_transaction()?;
        assert!(txn.store_exists("doomed")?);
        let doomed = txn.get_store("doomed")?;
        txn.remove_store("doomed")?;
        assert!(!txn.store_exists("doomed")?);
        assert!(matches!(txn.get(&doomed, b"k"), Err(Error::StoreNotFound(_))));
        assert!(matches!(txn.remove_store("doomed"), Err(Error::StoreNotFound(_))));

        // created and removed in the same transaction leaves no trace
        txn.open_store("scratch", StoreConfig::WITH_DUPLICATES)?;
        txn.remove_store("scratch")?;
        assert!(txn.commit()?);

        let names = env.compute_in_readonly_transaction(|txn| txn.store_names())?;
        assert!(names.is_empty());

        let mut txn = env.begin_readonly_transaction()?;
        assert!(matches!(txn.open_store("new", StoreConfig::default()), Err(Error::ReadOnly)));
        txn.abort()?;
        Ok(())
    }

    #[test]
    fn test_failed_commit_hook_makes_environment_inoperative() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        put(&env, "s", b"k", b"v")?;

        let mut txn = env.begin_transaction()?;
        let store = txn.get_store("s")?;
        txn.put(&store, b"k", b"w")?;
        txn.on_commit(|_| Err(Error::InvalidState("hook failed".to_string())))?;
        assert!(txn.commit().is_err());
        drop(txn);

        assert!(!env.is_operative());
        assert!(matches!(env.begin_transaction(), Err(Error::Inoperative(_))));
        assert!(matches!(env.begin_readonly_transaction(), Err(Error::Inoperative(_))));
        Ok(())
    }

    #[test]
    fn test_transaction_discipline() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;

        let mut outer = env.begin_transaction()?;
        let mut inner = env.begin_transaction()?;
        assert!(matches!(outer.abort(), Err(Error::NestedNotFinished)));
        inner.abort()?;
        assert!(matches!(inner.abort(), Err(Error::TransactionFinished)));
        outer.abort()?;

        let mut txn = env.begin_transaction()?;
        let result = thread::scope(|scope| scope.spawn(|| txn.abort()).join().unwrap());
        assert!(matches!(result, Err(Error::WrongThread)));
        txn.abort()?;
        assert_eq!(env.transaction_count(), 0);
        Ok(())
    }

    #[test]
    fn test_close_refuses_open_transactions() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        let mut txn = env.begin_readonly_transaction()?;
        assert!(matches!(env.close(), Err(Error::InvalidState(_))));
        txn.abort()?;
        env.close()?;
        assert!(matches!(env.begin_transaction(), Err(Error::InvalidState(_))));
        Ok(())
    }

    #[test]
    fn test_gc_transaction_times_out() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir).gc_txn_acquire_timeout(Duration::from_millis(50)))?;
        let mut txn = env.begin_transaction()?;

        let result = thread::scope(|scope| {
            scope
                .spawn(|| env.begin_gc_transaction().map(|_| ()))
                .join()
                .unwrap()
        });
        assert!(matches!(result, Err(Error::TransactionAcquireTimeout(_))));

        txn.abort()?;
        let mut gc = env.begin_gc_transaction()?;
        assert!(gc.is_exclusive());
        gc.abort()?;
        Ok(())
    }

    #[test]
    fn test_expired_loggables_reach_gc() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        let tracker = Arc::new(UtilizationTracker::new(env.log().layout()));
        env.set_gc_hooks(tracker.clone())?;

        put(&env, "s", b"k", b"v1")?;
        assert!(tracker.expired_bytes(0) > 0);
        let before = tracker.expired_bytes(0);
        put(&env, "s", b"k", b"v2")?;
        assert!(tracker.expired_bytes(0) > before);

        env.suspend_gc();
        assert!(tracker.is_suspended());
        env.resume_gc();
        assert!(!tracker.is_suspended());
        Ok(())
    }

    #[test]
    fn test_file_removal_waits_for_readers() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(
            EnvironmentConfig::new(dir.path())
                .page_size(1024)
                .file_length(8 * 1024)
                .log_sync_period(None),
        )?;
        for i in 0..40u32 {
            put(&env, "s", format!("key-{}", i).as_bytes(), &[7u8; 40])?;
        }
        let files = env.log().file_addresses();
        assert!(files.len() >= 2);

        let mut reader = env.begin_readonly_transaction()?;
        assert!(env.oldest_snapshot_root() <= env.meta_tree().root_address());
        env.remove_files(vec![files[0]])?;
        let path = dir
            .path()
            .join(format!("{:016x}.{}", files[0], crate::log::block::BLOCK_EXTENSION));
        assert!(path.exists());

        reader.abort()?;
        assert!(!path.exists());
        assert!(!env.log().file_addresses().contains(&files[0]));
        Ok(())
    }

    fn log_bytes(dir: &TempDir) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(dir.path())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(crate::log::block::BLOCK_EXTENSION) {
                total += std::fs::metadata(&path)?.len();
            }
        }
        Ok(total)
    }

    #[test]
    fn test_failed_save_rolls_back_commit() -> Result<()> {
        let dir = TempDir::new()?;
        let env = Environment::open(config(&dir))?;
        put(&env, "s", b"a", b"1")?;
        let high = env.log().high_address();
        let stored = log_bytes(&dir)?;
        let root = env.meta_tree().root_address();

        let mut txn = env.begin_transaction()?;
        let store = txn.get_store("s")?;
        // enough chunks to spill into a second file before the last entry fails
        for i in 0..20u32 {
            txn.put(&store, format!("b{:02}", i).as_bytes(), &[2u8; 4000])?;
        }
        txn.put(&store, b"z", &[3u8; 70_000])?;
        assert!(matches!(txn.commit(), Err(Error::RecordTooLarge { .. })));
        txn.abort()?;

        assert!(env.is_operative());
        assert_eq!(env.log().high_address(), high);
        assert_eq!(log_bytes(&dir)?, stored);
        assert_eq!(env.meta_tree().root_address(), root);
        assert_eq!(get(&env, "s", b"b00")?, None);

        put(&env, "s", b"c", b"3")?;
        // the next commit starts where the failed one did
        let next = env.log().read(env.log().layout().normalize(high))?;
        assert_eq!(next.kind(), crate::tree::flat::CHUNK_TYPE);
        assert!(env.meta_tree().root_address() > high);
        drop(txn);
        drop(env);

        let env = Environment::open(config(&dir))?;
        assert_eq!(get(&env, "s", b"a")?, Some(b"1".to_vec()));
        assert_eq!(get(&env, "s", b"c")?, Some(b"3".to_vec()));
        assert_eq!(get(&env, "s", b"z")?, None);
        Ok(())
    }

    struct Xor;

    impl Cipher for Xor {
        fn crypt(&self, address: u64, data: &mut [u8]) {
            for (i, byte) in data.iter_mut().enumerate() {
                *byte ^= ((address + i as u64) as u8) ^ 0x5a;
            }
        }
    }

    #[test]
    fn test_wrong_cipher_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let env = Environment::open(config(&dir).cipher(Arc::new(Xor)))?;
            for i in 0..50u32 {
                put(&env, "s", format!("key-{}", i).as_bytes(), &[1u8; 64])?;
            }
        }
        let stored = log_bytes(&dir)?;

        let result = Environment::open(config(&dir));
        assert!(matches!(result, Err(Error::InvalidCipherParameters)));
        assert_eq!(log_bytes(&dir)?, stored);

        let env = Environment::open(config(&dir).cipher(Arc::new(Xor)))?;
        for i in 0..50u32 {
            let key = format!("key-{}", i);
            assert_eq!(get(&env, "s", key.as_bytes())?, Some(vec![1u8; 64]), "{}", key);
        }
        Ok(())
    }
}
