//! Process tasks: optimizations applied to the target pid after launcher
//! mapping. Failures never abort the request; a vanished pid is dropped
//! silently by the kernel call failing.

use crate::optimizer::OptimizedProcess;
use crate::renicer;
use crate::state::AppState;
use crate::system;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcTask {
    ReniceProcess,
    ChangeCpuAffinity,
    ChangeCpuScalingPolicy,
    ChangeProcessIoClass,
}

impl ProcTask {
    /// Fixed execution order.
    pub const ALL: [ProcTask; 4] = [
        ProcTask::ReniceProcess,
        ProcTask::ChangeCpuAffinity,
        ProcTask::ChangeCpuScalingPolicy,
        ProcTask::ChangeProcessIoClass,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReniceProcess => "ReniceProcess",
            Self::ChangeCpuAffinity => "ChangeCpuAffinity",
            Self::ChangeCpuScalingPolicy => "ChangeCpuScalingPolicy",
            Self::ChangeProcessIoClass => "ChangeProcessIoClass",
        }
    }

    pub async fn is_available(&self, state: &AppState) -> (bool, Option<String>) {
        match self {
            Self::ReniceProcess | Self::ChangeCpuScalingPolicy => (true, None),
            Self::ChangeCpuAffinity => {
                if state.cpu_count == 0 {
                    (
                        false,
                        Some("no CPUs detected. It will not be possible to change CPU affinity".to_string()),
                    )
                } else {
                    (true, None)
                }
            }
            Self::ChangeProcessIoClass => {
                if which::which("ionice").is_err() {
                    (
                        false,
                        Some(
                            "'ionice' is not installed. It will not be possible to change a process IO scheduling"
                                .to_string(),
                        ),
                    )
                } else {
                    (true, None)
                }
            }
        }
    }

    pub async fn should_run(&self, state: &AppState, process: &OptimizedProcess) -> bool {
        let Some(settings) = process.profile.as_deref().and_then(|p| p.process.as_ref()) else {
            return false;
        };
        match self {
            Self::ReniceProcess => match &settings.nice {
                Some(nice) if nice.level.is_some() => {
                    if nice.has_valid_level() {
                        true
                    } else {
                        warn!(
                            "invalid nice level ({:?}) defined. Valid values between -20 and 19. \
                             Process ({:?}) will not be reniced (request={:?})",
                            nice.level, process.pid, process.request.pid
                        );
                        false
                    }
                }
                _ => false,
            },
            Self::ChangeCpuAffinity => match &settings.affinity {
                Some(affinity) if !affinity.is_empty() => {
                    if settings.has_valid_cpu_affinity(state.cpu_count) {
                        true
                    } else {
                        warn!(
                            "invalid CPU affinity defined ({affinity:?}). It must be a list of integers \
                             between '0' and '{}' (request={:?})",
                            state.cpu_count.saturating_sub(1),
                            process.request.pid
                        );
                        false
                    }
                }
                _ => false,
            },
            Self::ChangeCpuScalingPolicy => {
                let Some(sched) = settings.scheduling.as_ref() else {
                    return false;
                };
                let Some(policy) = sched.policy else {
                    return false;
                };
                if policy.requires_root() && !nix::unistd::Uid::current().is_root() {
                    warn!(
                        "not possible to change the scheduling policy for process '{:?}' to '{}'. \
                         It requires root privileges (request={:?})",
                        process.pid,
                        policy.name(),
                        process.request.pid
                    );
                    return false;
                }
                if policy.requires_priority() && sched.priority.is_some() && !sched.has_valid_priority() {
                    warn!(
                        "invalid priority '{:?}' defined for scheduling policy '{}' (request={:?})",
                        sched.priority,
                        policy.name(),
                        process.request.pid
                    );
                    return false;
                }
                true
            }
            Self::ChangeProcessIoClass => {
                let Some(io) = settings.io.as_ref() else {
                    return false;
                };
                let Some(class) = io.class else {
                    return false;
                };
                if class.supports_priority() && io.nice.is_some() && !io.has_valid_priority() {
                    warn!(
                        "invalid IO nice level ({:?}) defined. It must be a value between 0 and 7. \
                         IO class will not be changed (request={:?})",
                        io.nice, process.request.pid
                    );
                    return false;
                }
                true
            }
        }
    }

    pub async fn run(&self, state: &AppState, process: &OptimizedProcess) {
        let Some(pid) = process.pid else {
            return;
        };
        match self {
            Self::ReniceProcess => renice(state, process, pid).await,
            Self::ChangeCpuAffinity => change_affinity(process, pid),
            Self::ChangeCpuScalingPolicy => change_scaling_policy(process, pid),
            Self::ChangeProcessIoClass => change_io_class(process, pid).await,
        }
    }
}

async fn renice(state: &AppState, process: &OptimizedProcess, pid: i32) {
    let Some(nice) = process
        .profile
        .as_deref()
        .and_then(|p| p.process.as_ref())
        .and_then(|p| p.nice.clone())
    else {
        return;
    };
    let Some(level) = nice.level else {
        return;
    };

    if let Some(delay) = nice.delay {
        if delay > 0.0 {
            info!(
                "delaying process '{pid}' renicing for {delay} seconds (request={:?})",
                process.request.pid
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        } else {
            warn!(
                "invalid nice delay defined for process '{pid}': {delay} (must be higher than zero) \
                 (request={:?})",
                process.request.pid
            );
        }
    }

    renicer::set_priority(pid, level, process.request.pid.unwrap_or(-1));

    if nice.watch == Some(true)
        && state
            .renicer
            .add(pid, level, process.request.pid.unwrap_or(-1))
            .await
    {
        state.renicer.clone().watch().await;
    }
}

fn change_affinity(process: &OptimizedProcess, pid: i32) {
    let Some(affinity) = process
        .profile
        .as_deref()
        .and_then(|p| p.process.as_ref())
        .and_then(|p| p.affinity.clone())
    else {
        return;
    };

    let mut cpu_set = nix::sched::CpuSet::new();
    for idx in &affinity {
        if cpu_set.set(*idx).is_err() {
            error!(
                "could not change process '{pid}' CPU affinity to {affinity:?} (request={:?})",
                process.request.pid
            );
            return;
        }
    }

    match nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(pid), &cpu_set) {
        Ok(()) => info!(
            "process '{pid}' CPU affinity changed to {affinity:?} (request={:?})",
            process.request.pid
        ),
        Err(_) => error!(
            "could not change process '{pid}' CPU affinity to {affinity:?} (request={:?})",
            process.request.pid
        ),
    }
}

fn change_scaling_policy(process: &OptimizedProcess, pid: i32) {
    let Some(sched) = process
        .profile
        .as_deref()
        .and_then(|p| p.process.as_ref())
        .and_then(|p| p.scheduling.clone())
    else {
        return;
    };
    let Some(policy) = sched.policy else {
        return;
    };

    let priority = if policy.requires_priority() {
        match sched.priority {
            Some(priority) => priority,
            None => {
                warn!(
                    "no priority set for policy '{}'. ('1' will be used) (request={:?})",
                    policy.name(),
                    process.request.pid
                );
                1
            }
        }
    } else {
        if let Some(ignored) = sched.priority {
            warn!(
                "scheduling policy '{}' does not require priority ('{ignored}' will be ignored) \
                 (request={:?})",
                policy.name(),
                process.request.pid
            );
        }
        0
    };

    let param = libc::sched_param {
        sched_priority: priority,
    };
    let res = unsafe { libc::sched_setscheduler(pid, policy.to_raw(), &param) };
    if res == 0 {
        info!(
            "process '{pid}' scheduling policy changed to '{}'{} (request={:?})",
            policy.name(),
            if priority != 0 { format!(" (priority: {priority})") } else { String::new() },
            process.request.pid
        );
    } else {
        error!(
            "could not change process '{pid}' scheduling policy to '{}' (request={:?})",
            policy.name(),
            process.request.pid
        );
    }
}

async fn change_io_class(process: &OptimizedProcess, pid: i32) {
    let Some(io) = process
        .profile
        .as_deref()
        .and_then(|p| p.process.as_ref())
        .and_then(|p| p.io.clone())
    else {
        return;
    };
    let Some(class) = io.class else {
        return;
    };

    let priority = if class.supports_priority() {
        let priority = io.nice.unwrap_or_else(|| {
            warn!(
                "no nice level defined for IO class '{}'. '0' will be considered (request={:?})",
                class.name(),
                process.request.pid
            );
            0
        });
        Some(priority)
    } else {
        None
    };

    let mut cmd = format!("ionice -p {pid} -c {}", class.ionice_class());
    if let Some(priority) = priority {
        cmd.push_str(&format!(" -n {priority}"));
    }

    info!(
        "changing process '{pid}' IO class to '{}'{} (request={:?}): {cmd}",
        class.name(),
        priority.map(|p| format!(" (priority: {p})")).unwrap_or_default(),
        process.request.pid
    );

    let (code, output) = system::run_shell(&cmd, None).await;
    if code != 0 {
        error!(
            "could not change process '{pid}' IO class (request={:?})",
            process.request.pid
        );
        if let Some(output) = output {
            for line in output.lines() {
                error!("{line}");
            }
        }
    }
}
