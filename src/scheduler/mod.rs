use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// How long shutdown waits for a task that ignores the shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs periodic background tasks on a small runtime of its own, so callers
/// never need to be async themselves.
pub struct Scheduler {
    runtime: Runtime,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        f.debug_struct("Scheduler").field("tasks", &tasks).finish()
    }
}

impl Scheduler {
    pub fn new(thread_name: &str) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_time()
            .build()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            runtime,
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock()?.push(handle);
        Ok(self)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stops every task and waits for the running ones to return.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let tasks = std::mem::take(&mut *self.tasks.lock()?);

        // blocking on the runtime from inside another one would panic
        if Handle::try_current().is_ok() {
            self.runtime.shutdown_background();
            return Ok(());
        }

        let joined: Result<()> = self.runtime.block_on(async {
            for task in tasks {
                task.await
                    .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
            }
            Ok(())
        });
        self.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_runs_tasks() -> Result<()> {
        let scheduler = Scheduler::new("test-scheduler")?;
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }))?;

        std::thread::sleep(Duration::from_millis(80));
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_no_runs_after_shutdown() -> Result<()> {
        let scheduler = Scheduler::new("test-scheduler")?;
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }))?;
        std::thread::sleep(Duration::from_millis(25));

        let start = std::time::Instant::now();
        scheduler.shutdown()?;
        assert!(start.elapsed() < Duration::from_millis(500));

        let after_shutdown = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);

        Ok(())
    }
}
