//! Rebuilds the meta tree when an environment opens.
//!
//! The newest database root whose checksum matches and whose meta tree and
//! store trees load completely defines the database. Everything after it is
//! discarded. A clean shutdown recorded in the startup metadata lets recovery
//! check that single root instead of scanning.

use std::sync::Arc;

use crate::error::Result;
use crate::log::tip::LogTip;
use crate::log::Log;
use crate::tree::TreeLoader;
use crate::Error;

use super::root::{DatabaseRoot, DATABASE_ROOT_TYPE};
use super::MetaTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Empty,
    Scanning,
    Recovered,
    Unrecoverable,
}

/// Outcome of a successful recovery.
#[derive(Debug)]
pub struct Recovery {
    pub state: RecoveryState,
    /// `None` for an empty log.
    pub meta: Option<MetaTree>,
    /// Bytes cut from the end of the log.
    pub discarded: u64,
    /// Database roots rejected before one was accepted.
    pub rejected: usize,
}

pub struct Recoverer<'a> {
    log: &'a Log,
    loader: &'a dyn TreeLoader,
    state: RecoveryState,
    rejected: usize,
}

impl<'a> Recoverer<'a> {
    pub fn new(log: &'a Log, loader: &'a dyn TreeLoader) -> Self {
        Self {
            log,
            loader,
            state: RecoveryState::Empty,
            rejected: 0,
        }
    }

    fn transition(&mut self, state: RecoveryState) {
        tracing::debug!(from = ?self.state, to = ?state, "Recovery state change");
        self.state = state;
    }

    pub fn recover(mut self) -> Result<Recovery> {
        let tip = self.log.tip();
        // an unreadable tail is not an empty log, its bytes may be a database
        // written with other cipher parameters
        if tip.high_address() == tip.low_address() && !tip.has_unreadable_tail() {
            tracing::info!("Log is empty, nothing to recover");
            return Ok(Recovery {
                state: RecoveryState::Empty,
                meta: None,
                discarded: 0,
                rejected: 0,
            });
        }

        let stored = tip.stored_high_address();
        if let Some(meta) = self.fast_path(&tip)? {
            let root = *meta.database_root();
            let meta = self.cut_after(tip, root, Some(meta))?;
            self.transition(RecoveryState::Recovered);
            tracing::info!(root = meta.root_address(), "Recovered from clean shutdown");
            return Ok(Recovery {
                state: self.state,
                meta: Some(meta),
                discarded: stored - root.end_address(),
                rejected: 0,
            });
        }

        self.transition(RecoveryState::Scanning);
        match self.scan(&tip)? {
            Some(root) => {
                let meta = self.cut_after(tip, root, None)?;
                self.transition(RecoveryState::Recovered);
                tracing::info!(
                    root = meta.root_address(),
                    rejected = self.rejected,
                    "Recovered database root"
                );
                Ok(Recovery {
                    state: self.state,
                    meta: Some(meta),
                    discarded: stored - root.end_address(),
                    rejected: self.rejected,
                })
            }
            None => {
                self.transition(RecoveryState::Unrecoverable);
                tracing::error!(
                    high_address = tip.high_address(),
                    stored_high_address = stored,
                    rejected = self.rejected,
                    "No valid database root found"
                );
                Err(Error::InvalidCipherParameters)
            }
        }
    }

    /// Removes every stored byte after the accepted root, including a tail
    /// the log could not read on open. This is the only place recovery
    /// changes the files.
    fn cut_after(
        &self,
        tip: Arc<LogTip>,
        root: DatabaseRoot,
        verified: Option<MetaTree>,
    ) -> Result<MetaTree> {
        let end = root.end_address();
        if end >= tip.stored_high_address() {
            return match verified {
                Some(meta) => Ok(meta),
                None => self.verify(&tip, root),
            };
        }
        tracing::warn!(
            root = root.address(),
            discarded = tip.stored_high_address() - end,
            "Truncating log after last valid root"
        );
        let tip = self.log.set_high_address(end)?;
        // the truncated log must still hold the whole database
        self.verify(&tip, root)
    }

    /// Accepts the root recorded at a clean shutdown if it still ends the log.
    fn fast_path(&mut self, tip: &LogTip) -> Result<Option<MetaTree>> {
        let startup = match self.log.startup_metadata()? {
            Some(startup) if startup.clean => startup,
            _ => return Ok(None),
        };
        let candidate = match self.log.read_with(tip, startup.root_address) {
            Ok(loggable) if loggable.kind() == DATABASE_ROOT_TYPE => DatabaseRoot::from_loggable(&loggable)?,
            Ok(_) => return Ok(None),
            Err(e) if e.is_corruption() => return Ok(None),
            Err(e) => return Err(e),
        };
        if candidate.end_address() != tip.high_address() {
            return Ok(None);
        }
        match self.verify(tip, candidate) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_corruption() => {
                tracing::warn!(error = %e, "Clean shutdown root failed verification");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Walks pages from the end of the log, decoding the loggables that start in
    /// each page and trying its database roots newest first.
    fn scan(&mut self, tip: &LogTip) -> Result<Option<DatabaseRoot>> {
        let layout = self.log.layout();
        let page_size = layout.page_size() as u64;
        let low = tip.low_address();
        let mut window_end = tip.high_address();
        let mut page = layout.page_address(tip.high_address());

        loop {
            match self.log.first_loggable_in_page(tip, page) {
                Ok(Some(start)) if start < window_end => {
                    let roots = self.roots_in(tip, start, window_end);
                    for root in roots.into_iter().rev() {
                        if self.accept(tip, root)? {
                            return Ok(Some(root));
                        }
                    }
                    window_end = start;
                }
                Ok(_) => {}
                Err(e) if e.is_corruption() => {
                    tracing::warn!(page, error = %e, "Unreadable page, discarding everything after it");
                    window_end = page;
                }
                Err(e) => return Err(e),
            }
            if page < low + page_size {
                return Ok(None);
            }
            page -= page_size;
        }
    }

    /// Database roots in `[start, end)`, stopping at the first undecodable loggable.
    fn roots_in(&self, tip: &LogTip, start: u64, end: u64) -> Vec<DatabaseRoot> {
        let source = self.log.source(tip);
        let mut roots = Vec::new();
        for loggable in source.iter_range(start, end) {
            match loggable {
                Ok(loggable) if loggable.kind() == DATABASE_ROOT_TYPE => {
                    match DatabaseRoot::from_loggable(&loggable) {
                        Ok(root) => roots.push(root),
                        Err(e) => {
                            tracing::debug!(address = loggable.address(), error = %e, "Skipping malformed root");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(start, error = %e, "Stopped decoding page window");
                    break;
                }
            }
        }
        roots
    }

    fn accept(&mut self, tip: &LogTip, root: DatabaseRoot) -> Result<bool> {
        match self.verify(tip, root) {
            Ok(_) => Ok(true),
            Err(e) if e.is_corruption() => {
                self.rejected += 1;
                tracing::debug!(root = root.address(), error = %e, "Rejected database root");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn verify(&self, tip: &LogTip, root: DatabaseRoot) -> Result<MetaTree> {
        let meta = MetaTree::load(self.log, tip, self.loader, root)?;
        meta.verify_stores(self.log, tip, self.loader)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::meta::structure_id::META_TREE_ID;
    use crate::meta::StoreMetadata;
    use crate::tree::flat::FlatTreeLoader;
    use crate::tree::{StoreConfig, Tree, TreeLoader};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LogConfig {
        LogConfig::new(dir.path()).page_size(256).file_length(2048)
    }

    /// Commits one store holding `count` keys and returns the new meta tree.
    fn commit_store(log: &Log, meta: &MetaTree, name: &str, id: u32, count: u32) -> Result<MetaTree> {
        let loader = FlatTreeLoader;
        let mut tree = loader.create(id).mutable_copy();
        for i in 0..count {
            tree.put(format!("{}-{}", name, i).as_bytes(), b"value")?;
        }
        let mut copy = meta.mutable_copy();
        copy.add_store(
            name,
            StoreMetadata {
                structure_id: id,
                config: StoreConfig::default(),
            },
        )?;

        let mut session = log.begin_write()?;
        let tree_root = tree.save(&mut session)?;
        copy.set_store_root(id, tree_root)?;
        let saved = copy.save(&mut session, id)?;
        session.end_write()?;
        Ok(MetaTree::new(saved.tree, saved.root))
    }

    #[test]
    fn test_empty_log() -> Result<()> {
        let dir = TempDir::new()?;
        let log = Log::open(config(&dir))?;
        let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
        assert_eq!(recovery.state, RecoveryState::Empty);
        assert!(recovery.meta.is_none());
        Ok(())
    }

    #[test]
    fn test_recovery_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let log = Log::open(config(&dir))?;
            let meta = MetaTree::create(&log, &FlatTreeLoader)?;
            let meta = commit_store(&log, &meta, "a", 2, 10)?;
            commit_store(&log, &meta, "b", 3, 50)?;
            log.close()?;
        }

        let first = {
            let log = Log::open(config(&dir))?;
            let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
            recovery.meta.unwrap()
        };
        let second = {
            let log = Log::open(config(&dir))?;
            let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
            assert_eq!(recovery.discarded, 0);
            recovery.meta.unwrap()
        };

        assert_eq!(first.root_address(), second.root_address());
        assert_eq!(first.store_names()?, second.store_names()?);
        assert_eq!(second.store_names()?, vec!["a".to_string(), "b".to_string()]);

        Ok(())
    }

    #[test]
    fn test_trailing_garbage_is_discarded() -> Result<()> {
        let dir = TempDir::new()?;
        let root = {
            let log = Log::open(config(&dir))?;
            let meta = MetaTree::create(&log, &FlatTreeLoader)?;
            let meta = commit_store(&log, &meta, "a", 2, 5)?;

            // a half-finished commit: tree data without a database root
            let mut tree = FlatTreeLoader.create(3).mutable_copy();
            tree.put(b"orphan", b"1")?;
            let mut session = log.begin_write()?;
            tree.save(&mut session)?;
            session.end_write()?;
            log.close()?;
            meta.root_address()
        };

        let log = Log::open(config(&dir))?;
        let high_before = log.high_address();
        let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
        let meta = recovery.meta.unwrap();

        assert_eq!(meta.root_address(), root);
        assert!(recovery.discarded > 0);
        assert!(log.high_address() < high_before);
        assert_eq!(log.high_address(), meta.database_root().end_address());

        Ok(())
    }

    #[test]
    fn test_invalid_root_falls_back_to_previous() -> Result<()> {
        let dir = TempDir::new()?;
        let good = {
            let log = Log::open(config(&dir))?;
            let meta = MetaTree::create(&log, &FlatTreeLoader)?;
            let meta = commit_store(&log, &meta, "a", 2, 3)?;

            // root with a broken checksum
            let mut data = Vec::new();
            crate::log::varint::encode(meta.database_root().tree_address(), &mut data);
            crate::log::varint::encode(2, &mut data);
            crate::log::varint::encode(0, &mut data);
            let mut session = log.begin_write()?;
            session.write(DATABASE_ROOT_TYPE, META_TREE_ID as u64, &data)?;
            session.end_write()?;
            log.close()?;
            meta.root_address()
        };

        let log = Log::open(config(&dir))?;
        let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
        assert_eq!(recovery.meta.unwrap().root_address(), good);
        assert_eq!(recovery.rejected, 1);

        Ok(())
    }

    #[test]
    fn test_log_without_roots_is_unrecoverable() -> Result<()> {
        let dir = TempDir::new()?;
        let log = Log::open(config(&dir))?;
        let mut session = log.begin_write()?;
        session.write(3, 2, b"not a root")?;
        session.end_write()?;

        let result = Recoverer::new(&log, &FlatTreeLoader).recover();
        assert!(matches!(result, Err(Error::InvalidCipherParameters)));

        Ok(())
    }

    #[test]
    fn test_clean_shutdown_skips_scan() -> Result<()> {
        let dir = TempDir::new()?;
        let root = {
            let log = Log::open(config(&dir))?;
            let meta = MetaTree::create(&log, &FlatTreeLoader)?;
            let meta = commit_store(&log, &meta, "a", 2, 3)?;
            log.write_startup(meta.root_address(), true)?;
            log.close()?;
            meta.root_address()
        };

        let log = Log::open(config(&dir))?;
        let recovery = Recoverer::new(&log, &FlatTreeLoader).recover()?;
        assert_eq!(recovery.state, RecoveryState::Recovered);
        assert_eq!(recovery.meta.unwrap().root_address(), root);

        Ok(())
    }
}
