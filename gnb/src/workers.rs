//! Thread Profiles
//!
//! Maps the lower PHY roles (rx, tx, ul, dl) onto worker threads. The
//! pipeline only sees executors; how many threads back them, their
//! real-time priority and CPU placement are decided here once at startup.

use clap::ValueEnum;
use common::executor::{ExecutorError, TaskExecutor, TaskWorker, TaskWorkerPool, WorkerConfig};
use layers::phy::LowerPhyExecutors;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Tasks a lower PHY worker may queue
const WORKER_QUEUE_SIZE: usize = 128;

/// Highest SCHED_FIFO priority handed out
const MAX_PRIORITY: i32 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThreadProfile {
    /// One thread runs every role
    #[default]
    Single,
    /// Receive side and transmit side on separate threads
    Dual,
    /// A dedicated, pinned thread per role
    Quad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Rx,
    Tx,
    Ul,
    Dl,
}

/// One worker thread of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub name: &'static str,
    pub roles: Vec<Role>,
    pub priority: Option<i32>,
    pub affinity: Option<usize>,
}

impl ThreadProfile {
    /// Worker threads of the profile for a host with `nof_cpus` CPUs
    pub fn plan(self, nof_cpus: usize) -> Vec<WorkerPlan> {
        let worker = |name, roles: &[Role], priority| WorkerPlan {
            name,
            roles: roles.to_vec(),
            priority: Some(priority),
            affinity: None,
        };
        match self {
            ThreadProfile::Single => vec![worker("low_phy", &[Role::Rx, Role::Tx, Role::Ul, Role::Dl], MAX_PRIORITY)],
            ThreadProfile::Dual => pinned(
                vec![
                    worker("low_rx", &[Role::Rx, Role::Ul], MAX_PRIORITY),
                    worker("low_tx", &[Role::Tx, Role::Dl], MAX_PRIORITY),
                ],
                nof_cpus,
            ),
            ThreadProfile::Quad => pinned(
                vec![
                    worker("low_rx", &[Role::Rx], MAX_PRIORITY),
                    worker("low_tx", &[Role::Tx], MAX_PRIORITY),
                    worker("low_ul", &[Role::Ul], MAX_PRIORITY - 1),
                    worker("low_dl", &[Role::Dl], MAX_PRIORITY - 1),
                ],
                nof_cpus,
            ),
        }
    }
}

/// One CPU per worker starting at CPU 1, which leaves CPU 0 to the rest of
/// the system. Without a spare CPU the workers stay unpinned.
fn pinned(mut plan: Vec<WorkerPlan>, nof_cpus: usize) -> Vec<WorkerPlan> {
    if nof_cpus > plan.len() {
        for (index, worker) in plan.iter_mut().enumerate() {
            worker.affinity = Some(index + 1);
        }
    }
    plan
}

/// Running workers of the lower PHY and the application
pub struct LowerPhyWorkers {
    workers: Vec<Arc<TaskWorker>>,
    prach: Arc<TaskWorkerPool>,
    async_pool: Arc<TaskWorkerPool>,
    executors: LowerPhyExecutors,
}

impl LowerPhyWorkers {
    pub fn new(profile: ThreadProfile) -> Result<Self, ExecutorError> {
        let nof_cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let plan = profile.plan(nof_cpus);

        let mut workers = Vec::with_capacity(plan.len());
        for entry in &plan {
            let mut config = WorkerConfig::new(entry.name, WORKER_QUEUE_SIZE);
            if let Some(priority) = entry.priority {
                config = config.with_priority(priority);
            }
            if let Some(cpu) = entry.affinity {
                config = config.with_affinity(cpu);
            }
            workers.push(TaskWorker::new(config)?);
        }

        let executor_for = |role: Role| -> Result<Arc<dyn TaskExecutor>, ExecutorError> {
            plan.iter()
                .position(|entry| entry.roles.contains(&role))
                .map(|index| workers[index].clone() as Arc<dyn TaskExecutor>)
                .ok_or_else(|| ExecutorError::SpawnFailed(format!("{:?}", role), "no worker for role".into()))
        };
        let prach = TaskWorkerPool::new("low_phy_prach", 1)?;
        let executors = LowerPhyExecutors {
            rx: executor_for(Role::Rx)?,
            tx: executor_for(Role::Tx)?,
            ul: executor_for(Role::Ul)?,
            dl: executor_for(Role::Dl)?,
            prach: prach.clone(),
        };
        let async_pool = TaskWorkerPool::new("async_thread", 1)?;

        info!("Thread profile {:?}: {} lower PHY workers", profile, workers.len());
        Ok(Self {
            workers,
            prach,
            async_pool,
            executors,
        })
    }

    pub fn executors(&self) -> LowerPhyExecutors {
        self.executors.clone()
    }

    /// Executor for radio notifications
    pub fn async_executor(&self) -> Arc<dyn TaskExecutor> {
        self.async_pool.clone()
    }

    /// Stop every worker. Blocks until their threads are joined.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
        self.prach.stop();
        self.async_pool.stop();
        info!("Lower PHY workers stopped");
    }
}
