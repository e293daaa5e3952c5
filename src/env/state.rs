use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::error::Result;
use crate::Error;

/// Whether an environment still accepts work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvState {
    Operative,
    /// A commit failed after its bytes were confirmed; nothing more is allowed.
    Inoperative(String),
    Closed,
}

impl EnvState {
    pub fn check(&self) -> Result<()> {
        match self {
            EnvState::Operative => Ok(()),
            EnvState::Inoperative(reason) => Err(Error::Inoperative(reason.clone())),
            EnvState::Closed => Err(Error::InvalidState("environment is closed".to_string())),
        }
    }
}

/// Open transactions of each thread, innermost last.
#[derive(Debug, Default)]
pub struct ThreadTransactions {
    stacks: Mutex<HashMap<ThreadId, Vec<u64>>>,
}

impl ThreadTransactions {
    pub fn push(&self, thread: ThreadId, txn: u64) -> Result<()> {
        self.stacks.lock()?.entry(thread).or_default().push(txn);
        Ok(())
    }

    /// Fails unless `txn` is the innermost open transaction of `thread`.
    pub fn check_innermost(&self, thread: ThreadId, txn: u64) -> Result<()> {
        let stacks = self.stacks.lock()?;
        match stacks.get(&thread).and_then(|stack| stack.last()) {
            Some(top) if *top == txn => Ok(()),
            Some(_) => Err(Error::NestedNotFinished),
            None => Err(Error::InvalidState(format!(
                "transaction {} is not registered for this thread",
                txn
            ))),
        }
    }

    pub fn remove(&self, thread: ThreadId, txn: u64) -> Result<()> {
        let mut stacks = self.stacks.lock()?;
        if let Some(stack) = stacks.get_mut(&thread) {
            stack.retain(|id| *id != txn);
            if stack.is_empty() {
                stacks.remove(&thread);
            }
        }
        Ok(())
    }

    pub fn depth(&self, thread: ThreadId) -> usize {
        match self.stacks.lock() {
            Ok(stacks) => stacks.get(&thread).map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().get(&thread).map_or(0, Vec::len),
        }
    }
}

pub type SafeTask = Box<dyn FnOnce() + Send>;

/// Tasks waiting for every snapshot registered before them to finish.
#[derive(Default)]
pub struct DeferredTasks {
    tasks: Mutex<Vec<(u64, SafeTask)>>,
}

impl std::fmt::Debug for DeferredTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTasks")
            .field("pending", &self.len())
            .finish()
    }
}

impl DeferredTasks {
    /// Queues a task that may run once no snapshot id below `threshold` is live.
    pub fn push(&self, threshold: u64, task: SafeTask) -> Result<()> {
        self.tasks.lock()?.push((threshold, task));
        Ok(())
    }

    /// Removes the tasks runnable when the oldest live snapshot id is `oldest`.
    pub fn take_ready(&self, oldest: Option<u64>) -> Result<Vec<SafeTask>> {
        let mut tasks = self.tasks.lock()?;
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
            .into_iter()
            .partition(|(threshold, _)| oldest.map_or(true, |id| id >= *threshold));
        *tasks = pending;
        Ok(ready.into_iter().map(|(_, task)| task).collect())
    }

    pub fn len(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
