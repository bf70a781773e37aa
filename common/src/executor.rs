//! Task Executors
//!
//! The lower PHY never spawns threads on its own: every piece of work is
//! handed to a [`TaskExecutor`]. Two implementations are provided:
//!
//! - [`TaskWorker`]: a single named OS thread draining a bounded queue in
//!   FIFO order, optionally pinned to a CPU and raised to real-time priority.
//! - [`TaskWorkerPool`]: a small tokio multi-thread runtime for work that may
//!   run concurrently (PRACH detection, radio notifications).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Unit of work accepted by executors
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Task queue of executor '{0}' is full")]
    QueueFull(String),

    #[error("Executor '{0}' is stopped")]
    Stopped(String),

    #[error("Failed to spawn executor '{0}': {1}")]
    SpawnFailed(String, String),
}

/// Something that runs tasks
pub trait TaskExecutor: Send + Sync {
    /// Enqueue a task for execution
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;

    /// Enqueue a task that must not run inline with the caller
    fn defer(&self, task: Task) -> Result<(), ExecutorError> {
        self.execute(task)
    }

    /// Executor name used in logs
    fn name(&self) -> &str;
}

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name
    pub name: String,
    /// Capacity of the task queue
    pub queue_size: usize,
    /// CPU index to pin the thread to
    pub affinity: Option<usize>,
    /// SCHED_FIFO priority (1-99)
    pub priority: Option<i32>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, queue_size: usize) -> Self {
        Self {
            name: name.into(),
            queue_size,
            affinity: None,
            priority: None,
        }
    }

    pub fn with_affinity(mut self, cpu: usize) -> Self {
        self.affinity = Some(cpu);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Single-threaded FIFO executor backed by a dedicated OS thread
pub struct TaskWorker {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TaskWorker {
    /// Spawn the worker thread
    pub fn new(config: WorkerConfig) -> Result<Arc<Self>, ExecutorError> {
        let (sender, mut receiver) = mpsc::channel::<Task>(config.queue_size.max(1));
        let thread_config = config.clone();

        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                configure_current_thread(&thread_config);
                debug!("Worker '{}' started", thread_config.name);
                // Returns None once every sender is gone and the queue is drained
                while let Some(task) = receiver.blocking_recv() {
                    task();
                }
                debug!("Worker '{}' finished", thread_config.name);
            })
            .map_err(|e| ExecutorError::SpawnFailed(config.name.clone(), e.to_string()))?;

        info!(
            "Created worker '{}' (queue={}, cpu={:?}, priority={:?})",
            config.name, config.queue_size, config.affinity, config.priority
        );

        Ok(Arc::new(Self {
            name: config.name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Stop accepting tasks, drain the queue and join the thread.
    ///
    /// Safe to call several times and from any thread; when called from the
    /// worker itself the join is skipped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if thread::current().id() == handle.thread().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Worker '{}' panicked", self.name);
            }
        }
        info!("Worker '{}' stopped", self.name);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl TaskExecutor for TaskWorker {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| ExecutorError::Stopped(self.name.clone()))?;
        match sender.as_ref() {
            Some(sender) => sender.try_send(task).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ExecutorError::QueueFull(self.name.clone()),
                mpsc::error::TrySendError::Closed(_) => ExecutorError::Stopped(self.name.clone()),
            }),
            None => Err(ExecutorError::Stopped(self.name.clone())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pins the calling thread and raises its priority as configured.
///
/// Failures are not fatal: running without real-time privileges is common
/// in containers and test environments.
fn configure_current_thread(config: &WorkerConfig) {
    if let Some(cpu) = config.affinity {
        let core = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|core| core.id == cpu));
        match core {
            Some(core) => {
                if !core_affinity::set_for_current(core) {
                    warn!("Worker '{}': failed to pin to CPU {}", config.name, cpu);
                }
            }
            None => warn!("Worker '{}': CPU {} not available", config.name, cpu),
        }
    }

    if let Some(priority) = config.priority {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: pthread_self() is always a valid handle for the calling thread
        let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
        if ret != 0 {
            warn!(
                "Worker '{}': unable to set SCHED_FIFO priority {} (error {})",
                config.name, priority, ret
            );
        }
    }
}

/// Multi-threaded executor running tasks on a private tokio runtime
pub struct TaskWorkerPool {
    name: String,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl TaskWorkerPool {
    pub fn new(name: impl Into<String>, nof_threads: usize) -> Result<Arc<Self>, ExecutorError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(nof_threads.max(1))
            .thread_name(name.clone())
            .enable_time()
            .build()
            .map_err(|e| ExecutorError::SpawnFailed(name.clone(), e.to_string()))?;

        info!("Created worker pool '{}' with {} threads", name, nof_threads.max(1));

        Ok(Arc::new(Self {
            name,
            runtime: Mutex::new(Some(runtime)),
        }))
    }

    /// Shut the runtime down, giving running tasks a grace period
    pub fn stop(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut runtime) => runtime.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(Duration::from_secs(1));
            info!("Worker pool '{}' stopped", self.name);
        }
    }
}

impl TaskExecutor for TaskWorkerPool {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        let runtime = self
            .runtime
            .lock()
            .map_err(|_| ExecutorError::Stopped(self.name.clone()))?;
        match runtime.as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(task);
                Ok(())
            }
            None => Err(ExecutorError::Stopped(self.name.clone())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TaskWorkerPool {
    fn drop(&mut self) {
        let runtime = match self.runtime.get_mut() {
            Ok(runtime) => runtime.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            // Dropping a runtime inside another runtime's context panics
            runtime.shutdown_background();
        }
    }
}

/// Executor that runs every task inline on the caller's thread
pub struct InlineExecutor {
    name: String,
}

impl InlineExecutor {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        task();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_worker_runs_tasks_in_order() {
        let worker = TaskWorker::new(WorkerConfig::new("test_fifo", 64)).unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            worker.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        worker.stop();
        let received: Vec<i32> = rx.try_iter().collect();
        assert_eq!(received, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_queue_full() {
        let worker = TaskWorker::new(WorkerConfig::new("test_full", 1)).unwrap();
        let (block_tx, block_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        worker
            .execute(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = block_rx.recv();
            }))
            .unwrap();
        started_rx.recv().unwrap();

        // One slot in the queue, the second push must fail
        worker.execute(Box::new(|| {})).unwrap();
        let result = worker.execute(Box::new(|| {}));
        assert_eq!(result, Err(ExecutorError::QueueFull("test_full".into())));

        block_tx.send(()).unwrap();
        worker.stop();
    }

    #[test]
    fn test_worker_stop_is_idempotent() {
        let worker = TaskWorker::new(WorkerConfig::new("test_stop", 4)).unwrap();
        worker.stop();
        worker.stop();
        assert!(worker.is_stopped());
        assert_eq!(
            worker.execute(Box::new(|| {})),
            Err(ExecutorError::Stopped("test_stop".into()))
        );
    }

    #[test]
    fn test_worker_drains_queue_on_stop() {
        let worker = TaskWorker::new(WorkerConfig::new("test_drain", 16)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            worker
                .execute(Box::new(move || {
                    thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_worker_without_privileges_still_runs() {
        let config = WorkerConfig::new("test_rt", 4).with_priority(90).with_affinity(0);
        let worker = TaskWorker::new(config).unwrap();
        let (tx, rx) = std_mpsc::channel();
        worker.execute(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 7);
        worker.stop();
    }

    #[test]
    fn test_pool_runs_concurrently() {
        let pool = TaskWorkerPool::new("test_pool", 2).unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        received.sort();
        assert_eq!(received, vec![0, 1, 2, 3]);
        pool.stop();
        assert!(pool.execute(Box::new(|| {})).is_err());
    }
}
