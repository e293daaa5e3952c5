//! Admission control for transactions.
//!
//! A dispatcher owns a fixed number of permits. A transaction takes one; an
//! exclusive transaction takes all of them. A thread that already holds
//! permits may take more (nested transactions) and waits in its own queue,
//! which is always served before threads holding nothing.
//!
//! Every waiter parks on its own condition variable and is woken only when it
//! reaches the head of its queue, so admission is FIFO within each queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Regular,
    Nested,
}

#[derive(Default)]
struct DispatcherState {
    acquired: usize,
    threads: HashMap<ThreadId, usize>,
    regular: BTreeMap<u64, Arc<Condvar>>,
    nested: BTreeMap<u64, Arc<Condvar>>,
    next_ticket: u64,
}

impl DispatcherState {
    fn held(&self, thread: ThreadId) -> usize {
        self.threads.get(&thread).copied().unwrap_or(0)
    }

    fn queue(&mut self, queue: Queue) -> &mut BTreeMap<u64, Arc<Condvar>> {
        match queue {
            Queue::Regular => &mut self.regular,
            Queue::Nested => &mut self.nested,
        }
    }

    fn is_head(&self, queue: Queue, ticket: u64) -> bool {
        let waiters = match queue {
            Queue::Regular => &self.regular,
            Queue::Nested => &self.nested,
        };
        waiters.keys().next() == Some(&ticket)
    }

    fn enqueue(&mut self, queue: Queue) -> (u64, Arc<Condvar>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let signal = Arc::new(Condvar::new());
        self.queue(queue).insert(ticket, signal.clone());
        (ticket, signal)
    }

    /// Wakes the head of the nested queue, then the head of the regular one.
    fn notify_next(&self) {
        if let Some(signal) = self.nested.values().next() {
            signal.notify_one();
        }
        if let Some(signal) = self.regular.values().next() {
            signal.notify_one();
        }
    }
}

pub struct TransactionDispatcher {
    available: usize,
    state: Mutex<DispatcherState>,
}

impl std::fmt::Debug for TransactionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionDispatcher")
            .field("available", &self.available)
            .field("acquired", &self.acquired_permits())
            .finish()
    }
}

impl TransactionDispatcher {
    pub fn new(available: usize) -> Result<Self> {
        if available == 0 {
            return Err(Error::InvalidInput(
                "dispatcher needs at least one permit".to_string(),
            ));
        }
        Ok(Self {
            available,
            state: Mutex::new(DispatcherState::default()),
        })
    }

    pub fn available_permits(&self) -> usize {
        self.available
    }

    pub fn acquired_permits(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.acquired,
            Err(poisoned) => poisoned.into_inner().acquired,
        }
    }

    pub fn thread_permits(&self, thread: ThreadId) -> usize {
        match self.state.lock() {
            Ok(state) => state.held(thread),
            Err(poisoned) => poisoned.into_inner().held(thread),
        }
    }

    /// Takes one permit, blocking until it is this thread's turn.
    pub fn acquire(&self, thread: ThreadId) -> Result<usize> {
        let state = self.state.lock()?;
        let queue = self.queue_for(&state, thread)?;
        self.acquire_in(state, queue, thread, 1, None)
    }

    /// Takes every permit. A thread that already holds permits gets a single
    /// nested one instead; callers compare the returned count with
    /// [`available_permits`](Self::available_permits).
    pub fn acquire_exclusive(&self, thread: ThreadId) -> Result<usize> {
        let state = self.state.lock()?;
        match self.queue_for(&state, thread)? {
            Queue::Regular => self.acquire_in(state, Queue::Regular, thread, self.available, None),
            Queue::Nested => self.acquire_in(state, Queue::Nested, thread, 1, None),
        }
    }

    /// Like [`acquire_exclusive`](Self::acquire_exclusive), giving up after `timeout`.
    pub fn try_acquire_exclusive(&self, thread: ThreadId, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let state = self.state.lock()?;
        match self.queue_for(&state, thread)? {
            Queue::Regular => {
                self.acquire_in(state, Queue::Regular, thread, self.available, Some(deadline))
            }
            Queue::Nested => self.acquire_in(state, Queue::Nested, thread, 1, Some(deadline)),
        }
    }

    /// Returns `permits` held by `thread`.
    pub fn release(&self, thread: ThreadId, permits: usize) -> Result<()> {
        let mut state = self.state.lock()?;
        Self::release_locked(&mut state, thread, permits)?;
        state.notify_next();
        Ok(())
    }

    /// Leaves an exclusive holder with a single permit.
    pub fn downgrade(&self, thread: ThreadId, permits: usize) -> Result<usize> {
        if permits <= 1 {
            return Ok(permits);
        }
        self.release(thread, permits - 1)?;
        Ok(1)
    }

    fn queue_for(&self, state: &DispatcherState, thread: ThreadId) -> Result<Queue> {
        let held = state.held(thread);
        if held == 0 {
            return Ok(Queue::Regular);
        }
        if held >= self.available {
            return Err(Error::InvalidOperation(format!(
                "thread already holds all {} permits",
                self.available
            )));
        }
        Ok(Queue::Nested)
    }

    fn can_proceed(&self, state: &DispatcherState, queue: Queue, ticket: u64, permits: usize) -> bool {
        if state.acquired + permits > self.available || !state.is_head(queue, ticket) {
            return false;
        }
        // nested waiters go first
        queue == Queue::Nested || state.nested.is_empty()
    }

    fn acquire_in(
        &self,
        mut state: MutexGuard<'_, DispatcherState>,
        queue: Queue,
        thread: ThreadId,
        permits: usize,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let (ticket, signal) = state.enqueue(queue);

        while !self.can_proceed(&state, queue, ticket, permits) {
            match deadline {
                None => state = signal.wait(state)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.queue(queue).remove(&ticket);
                        state.notify_next();
                        tracing::debug!(permits, "Exclusive acquisition timed out");
                        return Err(Error::TransactionAcquireTimeout(format!(
                            "{} permits not available within the timeout",
                            permits
                        )));
                    }
                    state = signal.wait_timeout(state, deadline - now)?.0;
                }
            }
        }

        state.queue(queue).remove(&ticket);
        state.acquired += permits;
        *state.threads.entry(thread).or_insert(0) += permits;
        // the next waiter may fit as well
        state.notify_next();
        Ok(permits)
    }

    fn release_locked(state: &mut DispatcherState, thread: ThreadId, permits: usize) -> Result<()> {
        let held = state.held(thread);
        if permits > held || permits > state.acquired {
            return Err(Error::InvalidState(format!(
                "releasing {} permits but the thread holds {}",
                permits, held
            )));
        }
        state.acquired -= permits;
        if held == permits {
            state.threads.remove(&thread);
        } else {
            state.threads.insert(thread, held - permits);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn me() -> ThreadId {
        thread::current().id()
    }

    #[test]
    fn test_acquire_and_release() -> Result<()> {
        let dispatcher = TransactionDispatcher::new(3)?;
        assert_eq!(dispatcher.acquire(me())?, 1);
        assert_eq!(dispatcher.acquired_permits(), 1);
        assert_eq!(dispatcher.thread_permits(me()), 1);

        // nested
        assert_eq!(dispatcher.acquire(me())?, 1);
        assert_eq!(dispatcher.thread_permits(me()), 2);

        dispatcher.release(me(), 2)?;
        assert_eq!(dispatcher.acquired_permits(), 0);
        assert!(dispatcher.release(me(), 1).is_err());
        Ok(())
    }

    #[test]
    fn test_exclusive_takes_everything() -> Result<()> {
        let dispatcher = TransactionDispatcher::new(4)?;
        assert_eq!(dispatcher.acquire_exclusive(me())?, 4);
        assert_eq!(dispatcher.acquired_permits(), 4);

        // holding every permit, nesting is refused
        assert!(matches!(dispatcher.acquire(me()), Err(Error::InvalidOperation(_))));

        assert_eq!(dispatcher.downgrade(me(), 4)?, 1);
        assert_eq!(dispatcher.acquired_permits(), 1);

        // nested exclusive degrades to one permit
        assert_eq!(dispatcher.acquire_exclusive(me())?, 1);
        dispatcher.release(me(), 2)?;
        Ok(())
    }

    #[test]
    fn test_try_acquire_exclusive_times_out() -> Result<()> {
        let dispatcher = Arc::new(TransactionDispatcher::new(2)?);
        dispatcher.acquire(me())?;

        let other = dispatcher.clone();
        let result = thread::spawn(move || {
            other.try_acquire_exclusive(thread::current().id(), Duration::from_millis(50))
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(Error::TransactionAcquireTimeout(_))));

        // the abandoned ticket does not block later waiters
        let other = dispatcher.clone();
        let handle = thread::spawn(move || -> Result<()> {
            let thread = thread::current().id();
            other.acquire(thread)?;
            other.release(thread, 1)
        });
        handle.join().unwrap()?;

        dispatcher.release(me(), 1)?;
        Ok(())
    }

    #[test]
    fn test_permits_never_exceed_limit() -> Result<()> {
        const PERMITS: usize = 3;
        let dispatcher = Arc::new(TransactionDispatcher::new(PERMITS)?);
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let peak = peak.clone();
                thread::spawn(move || -> Result<()> {
                    let thread = thread::current().id();
                    for _ in 0..50 {
                        dispatcher.acquire(thread)?;
                        let acquired = dispatcher.acquired_permits();
                        peak.fetch_max(acquired, Ordering::SeqCst);
                        assert!(acquired <= PERMITS);
                        dispatcher.release(thread, 1)?;
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap()?;
        }
        assert!(peak.load(Ordering::SeqCst) <= PERMITS);
        assert_eq!(dispatcher.acquired_permits(), 0);
        Ok(())
    }

    #[test]
    fn test_exclusive_waiter_eventually_proceeds() -> Result<()> {
        let dispatcher = Arc::new(TransactionDispatcher::new(4)?);
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let stop = stop.clone();
                thread::spawn(move || -> Result<()> {
                    let thread = thread::current().id();
                    while !stop.load(Ordering::SeqCst) {
                        dispatcher.acquire(thread)?;
                        thread::sleep(Duration::from_millis(1));
                        dispatcher.release(thread, 1)?;
                    }
                    Ok(())
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        let permits = dispatcher.acquire_exclusive(me())?;
        assert_eq!(permits, 4);
        assert_eq!(dispatcher.acquired_permits(), 4);
        dispatcher.release(me(), permits)?;

        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap()?;
        }
        Ok(())
    }

    #[test]
    fn test_nested_waiter_served_before_regular() -> Result<()> {
        let dispatcher = Arc::new(TransactionDispatcher::new(2)?);
        let order = Arc::new(Mutex::new(Vec::new()));
        dispatcher.acquire(me())?;

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || -> Result<()> {
                let thread = thread::current().id();
                dispatcher.acquire(thread)?;
                release_rx.recv().ok();
                dispatcher.release(thread, 1)
            })
        };
        while dispatcher.acquired_permits() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        let regular = {
            let dispatcher = dispatcher.clone();
            let order = order.clone();
            thread::spawn(move || -> Result<()> {
                let thread = thread::current().id();
                dispatcher.acquire(thread)?;
                order.lock()?.push("regular");
                dispatcher.release(thread, 1)
            })
        };
        thread::sleep(Duration::from_millis(20));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            release_tx.send(()).ok();
        });

        // blocks until the blocker lets go, then wins over the queued regular thread
        dispatcher.acquire(me())?;
        order.lock()?.push("nested");
        dispatcher.release(me(), 2)?;

        releaser.join().unwrap();
        blocker.join().unwrap()?;
        regular.join().unwrap()?;

        assert_eq!(*order.lock()?, vec!["nested", "regular"]);
        Ok(())
    }
}
