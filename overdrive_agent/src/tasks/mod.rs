//! Task registry: the environment (machine-wide) and process (per-pid)
//! optimizations. Variants are enumerated at compile time; availability is
//! checked once at daemon start and unavailable tasks are excluded with a
//! single warning.

pub mod environment;
pub mod process;

use crate::optimizer::OptimizedProcess;
use crate::state::AppState;
pub use environment::{EnvOutcome, EnvTask};
pub use process::ProcTask;
use tracing::{debug, warn};

pub struct TaskRegistry {
    env_tasks: Vec<EnvTask>,
    proc_tasks: Vec<ProcTask>,
}

impl TaskRegistry {
    /// Probes every task variant once, in execution order.
    pub async fn check_availability(state: &AppState) -> Self {
        debug!("checking available tasks");

        let mut env_tasks = Vec::new();
        for task in EnvTask::ALL {
            let (available, reason) = task.is_available(state).await;
            if available {
                env_tasks.push(task);
            } else if let Some(reason) = reason {
                warn!("{reason}");
            }
        }

        let mut proc_tasks = Vec::new();
        for task in ProcTask::ALL {
            let (available, reason) = task.is_available(state).await;
            if available {
                proc_tasks.push(task);
            } else if let Some(reason) = reason {
                warn!("{reason}");
            }
        }

        if !env_tasks.is_empty() {
            debug!(
                "environment tasks available ({}): {}",
                env_tasks.len(),
                env_tasks.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
            );
        }
        if !proc_tasks.is_empty() {
            debug!(
                "process tasks available ({}): {}",
                proc_tasks.len(),
                proc_tasks.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
            );
        }

        Self {
            env_tasks,
            proc_tasks,
        }
    }

    /// Available environment tasks that should run for this process, honoring
    /// the self-request gate.
    pub async fn runnable_env_tasks(
        &self,
        state: &AppState,
        process: &OptimizedProcess,
    ) -> Vec<EnvTask> {
        let self_request = process.request.is_self_request();
        let mut runnable = Vec::new();
        for task in &self.env_tasks {
            if self_request && !task.allowed_for_self_requests() {
                continue;
            }
            if task.should_run(state, process).await {
                runnable.push(*task);
            }
        }
        runnable
    }

    pub async fn runnable_proc_tasks(
        &self,
        state: &AppState,
        process: &OptimizedProcess,
    ) -> Vec<ProcTask> {
        if process.request.is_self_request() {
            return Vec::new();
        }
        let mut runnable = Vec::new();
        for task in &self.proc_tasks {
            if task.should_run(state, process).await {
                runnable.push(*task);
            }
        }
        runnable
    }

    pub fn env_task_count(&self) -> usize {
        self.env_tasks.len()
    }

    pub fn proc_task_count(&self) -> usize {
        self.proc_tasks.len()
    }
}
