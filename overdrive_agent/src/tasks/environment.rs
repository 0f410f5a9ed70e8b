//! Environment tasks: machine-wide optimizations applied while the optimized
//! process lives. Each task returns an `EnvOutcome` describing the prior
//! state it captured; the handler merges the outcomes into the process record
//! before watcher enrollment.

use crate::compositor::{detect_compositor, CompositorContext};
use crate::cpu::{GovernorMap, GOVERNOR_PERFORMANCE, LEVEL_PERFORMANCE};
use crate::gpu::{GpuState, GpuVendor};
use crate::optimizer::OptimizedProcess;
use crate::scripts::ScriptRunner;
use crate::state::AppState;
use crate::system;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

static RE_KILL_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"kill\s*:\s*\(?(\d+)\)?").expect("kill failure regex"));

/// What an environment task captured for later restoration.
#[derive(Debug, Default)]
pub struct EnvOutcome {
    pub previous_governors: Option<GovernorMap>,
    pub cpu_energy_policy_changed: bool,
    pub previous_gpu_states: Option<HashMap<GpuVendor, HashSet<GpuState>>>,
    pub stopped_after_launch: Option<HashMap<String, Option<String>>>,
    pub related_pids: HashSet<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvTask {
    StopProcessesAfterLaunch,
    RunPostLaunchScripts,
    DisableWindowCompositor,
    HideMouseCursor,
    ChangeCpuFrequencyGovernor,
    ChangeCpuEnergyPolicyLevel,
    ChangeGpuModeToPerformance,
}

impl EnvTask {
    /// Fixed execution order.
    pub const ALL: [EnvTask; 7] = [
        EnvTask::StopProcessesAfterLaunch,
        EnvTask::RunPostLaunchScripts,
        EnvTask::DisableWindowCompositor,
        EnvTask::HideMouseCursor,
        EnvTask::ChangeCpuFrequencyGovernor,
        EnvTask::ChangeCpuEnergyPolicyLevel,
        EnvTask::ChangeGpuModeToPerformance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::StopProcessesAfterLaunch => "StopProcessesAfterLaunch",
            Self::RunPostLaunchScripts => "RunPostLaunchScripts",
            Self::DisableWindowCompositor => "DisableWindowCompositor",
            Self::HideMouseCursor => "HideMouseCursor",
            Self::ChangeCpuFrequencyGovernor => "ChangeCpuFrequencyGovernor",
            Self::ChangeCpuEnergyPolicyLevel => "ChangeCpuEnergyPolicyLevel",
            Self::ChangeGpuModeToPerformance => "ChangeGpuModeToPerformance",
        }
    }

    pub fn allowed_for_self_requests(&self) -> bool {
        matches!(
            self,
            Self::ChangeCpuFrequencyGovernor | Self::ChangeCpuEnergyPolicyLevel
        )
    }

    pub async fn is_available(&self, state: &AppState) -> (bool, Option<String>) {
        match self {
            Self::StopProcessesAfterLaunch | Self::RunPostLaunchScripts | Self::DisableWindowCompositor => {
                (true, None)
            }
            Self::HideMouseCursor => state.mouse.can_work(),
            Self::ChangeCpuFrequencyGovernor => {
                if state.cpu_count == 0 {
                    return (false, Some("no CPU detected".to_string()));
                }
                let cpu0 = state.cpufreq.cpu0_governor_file();
                if !std::path::Path::new(&cpu0).exists() {
                    return (
                        false,
                        Some(format!(
                            "it will not be possible to change the CPUs scaling governors: file '{cpu0}' not found"
                        )),
                    );
                }
                if !nix::unistd::Uid::current().is_root() {
                    return (
                        false,
                        Some(
                            "it will not be possible to change the CPUs scaling governors: requires root privileges"
                                .to_string(),
                        ),
                    );
                }
                (true, None)
            }
            Self::ChangeCpuEnergyPolicyLevel => state.cpu_energy.can_work(),
            Self::ChangeGpuModeToPerformance => {
                if !state.gpus.is_cache_enabled() {
                    return (true, None);
                }
                if state.gpus.map_working_drivers_and_gpus().await.is_empty() {
                    (false, Some("no manageable GPUs found".to_string()))
                } else {
                    (true, None)
                }
            }
        }
    }

    pub async fn should_run(&self, state: &AppState, process: &OptimizedProcess) -> bool {
        let Some(profile) = process.profile.as_deref() else {
            return false;
        };
        match self {
            Self::StopProcessesAfterLaunch => profile
                .stop_after
                .as_ref()
                .is_some_and(|s| !s.processes.is_empty()),
            Self::RunPostLaunchScripts => profile
                .after_scripts
                .as_ref()
                .is_some_and(|s| !s.scripts.is_empty()),
            Self::DisableWindowCompositor => {
                if profile.compositor.as_ref().and_then(|c| c.off) != Some(true) {
                    return false;
                }
                compositor_is_manageable(state, process).await
            }
            Self::HideMouseCursor => profile.hide_mouse == Some(true),
            Self::ChangeCpuFrequencyGovernor | Self::ChangeCpuEnergyPolicyLevel => {
                profile.cpu.as_ref().and_then(|c| c.performance) == Some(true)
            }
            Self::ChangeGpuModeToPerformance => {
                profile.gpu.as_ref().and_then(|g| g.performance) == Some(true)
            }
        }
    }

    pub async fn run(&self, state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
        match self {
            Self::StopProcessesAfterLaunch => stop_processes_after_launch(process).await,
            Self::RunPostLaunchScripts => run_post_launch_scripts(state, process).await,
            Self::DisableWindowCompositor => disable_window_compositor(state, process).await,
            Self::HideMouseCursor => hide_mouse_cursor(state, process).await,
            Self::ChangeCpuFrequencyGovernor => change_cpu_governor(state, process).await,
            Self::ChangeCpuEnergyPolicyLevel => change_cpu_energy_policy(state, process).await,
            Self::ChangeGpuModeToPerformance => change_gpu_mode(state, process).await,
        }
    }
}

/// Detect-once compositor gate: resolves and memoizes the compositor and its
/// manageability on the first request that needs it.
async fn compositor_is_manageable(state: &AppState, process: &OptimizedProcess) -> bool {
    let mut slot = state.compositor.lock().await;

    if slot.compositor.is_none() && !slot.detection_done {
        let detected = detect_compositor(process.user_id(), process.user_env()).await;
        if let Some(compositor) = detected {
            info!("window compositor detected: {}", compositor.name());
            slot.compositor = Some(compositor);
        }
        slot.detection_done = true;
    }

    if let Some(compositor) = &slot.compositor {
        if slot.manageable.is_none() {
            let (manageable, reason) = compositor.can_be_managed();
            let name = compositor.name().to_string();
            slot.manageable = Some(manageable);
            if !manageable {
                warn!(
                    "compositor {} cannot be managed{}",
                    name,
                    reason.map(|r| format!(". Reason: {r}")).unwrap_or_default()
                );
            }
        }
    }

    slot.compositor.is_some() && slot.manageable == Some(true)
}

async fn stop_processes_after_launch(process: &OptimizedProcess) -> EnvOutcome {
    let mut outcome = EnvOutcome::default();
    let Some(stop) = process.profile.as_deref().and_then(|p| p.stop_after.as_ref()) else {
        return outcome;
    };

    let mut stopped: HashMap<String, Option<String>> = HashMap::new();
    let found = system::find_pids_by_names(&stop.processes).await;
    let mut not_stopped: HashSet<String> = HashSet::new();

    if !found.is_empty() {
        let pids: HashSet<i32> = found.values().copied().collect();
        let pid_cmds = system::find_commands_by_pids(&pids).await;
        if pid_cmds.is_empty() {
            warn!("could not retrieve commands of processes to stop");
        }

        let kill_targets: Vec<String> = found.values().map(|p| p.to_string()).collect();
        let (_, kill_output) =
            system::run_shell(&format!("kill -9 {}", kill_targets.join(" ")), None).await;

        let not_killed: HashSet<i32> = kill_output
            .as_deref()
            .map(|output| {
                RE_KILL_FAILURE
                    .captures_iter(output)
                    .filter_map(|c| c.get(1)?.as_str().parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        for (comm, pid) in &found {
            if not_killed.contains(pid) {
                not_stopped.insert(comm.clone());
            } else if let Some(cmd) = pid_cmds.get(pid) {
                stopped.insert(comm.clone(), Some(cmd.clone()));
            }
        }
    }

    if !stopped.is_empty() {
        info!("processes stopped: {}", stopped.keys().cloned().collect::<Vec<_>>().join(", "));
    }
    if !not_stopped.is_empty() {
        warn!("failed to stop processes: {}", not_stopped.iter().cloned().collect::<Vec<_>>().join(", "));
    }

    // processes that were not running but do exist are reported with no
    // command so the restore engine knows they were never stopped
    if stopped.len() != stop.processes.len() {
        for comm in &stop.processes {
            if !stopped.contains_key(comm)
                && !not_stopped.contains(comm)
                && which::which(comm).is_ok()
            {
                stopped.insert(comm.clone(), None);
            }
        }
    }

    if !stopped.is_empty() {
        outcome.stopped_after_launch = Some(stopped);
    }
    outcome
}

async fn run_post_launch_scripts(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    let mut outcome = EnvOutcome::default();
    let Some(settings) = process.profile.as_deref().and_then(|p| p.after_scripts.clone()) else {
        return outcome;
    };
    let runner = ScriptRunner::new("post launch", state.config.allow_root_scripts);
    let started = runner
        .run(&[settings], process.user_id(), process.user_env())
        .await;
    outcome.related_pids.extend(started);
    outcome
}

async fn disable_window_compositor(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    let mut slot = state.compositor.lock().await;
    let Some(compositor) = slot.compositor.clone() else {
        return EnvOutcome::default();
    };

    let mut context = CompositorContext::new();
    let enabled = compositor
        .is_enabled(process.user_id(), process.user_env(), &mut context)
        .await;

    match enabled {
        None => {
            error!(
                "it will not be possible to disable the window compositor for process '{:?}'",
                process.pid
            );
        }
        Some(false) => info!("window compositor is already disabled"),
        Some(true) => {
            if compositor
                .disable(process.user_id(), process.user_env(), &context)
                .await
            {
                info!("window compositor disabled");
                slot.disabled_context = Some(context);
            }
        }
    }
    EnvOutcome::default()
}

async fn hide_mouse_cursor(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    state
        .mouse
        .hide_cursor(!process.request.is_self_request(), process.user_env())
        .await;
    EnvOutcome::default()
}

async fn change_cpu_governor(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    let mut outcome = EnvOutcome::default();
    let mut saved = state.cpufreq.lock().await;

    let current = state.cpufreq.map_current_governors().await;
    let mut prev_governors = GovernorMap::new();
    for (governor, cpus) in current {
        if governor != GOVERNOR_PERFORMANCE {
            let changed = state
                .cpufreq
                .change_governor(GOVERNOR_PERFORMANCE, Some(&cpus))
                .await;
            if !changed.is_empty() {
                prev_governors.insert(governor, changed);
            }
        }
    }

    if !process.request.is_self_request() {
        if !prev_governors.is_empty() {
            saved.save(&prev_governors);
            outcome.previous_governors = Some(prev_governors);
        } else if let Some(saved_map) = saved.as_governor_map() {
            // everything already at performance: the daemon still holds the
            // original mapping some earlier request captured
            outcome.previous_governors = Some(saved_map);
        }
    }
    outcome
}

async fn change_cpu_energy_policy(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    let mut outcome = EnvOutcome::default();
    let mut saved = state.cpu_energy.lock().await;

    let Some(current) = state.cpu_energy.map_current_state().await else {
        error!("could not determine the current CPUs energy policy level");
        return outcome;
    };

    let not_in_performance: HashMap<usize, i32> = current
        .iter()
        .filter(|(_, state)| **state != LEVEL_PERFORMANCE)
        .map(|(idx, state)| (*idx, *state))
        .collect();

    if not_in_performance.is_empty() {
        outcome.cpu_energy_policy_changed = !saved.is_empty();
        return outcome;
    }

    let wanted: HashMap<usize, i32> = not_in_performance
        .keys()
        .map(|idx| (*idx, LEVEL_PERFORMANCE))
        .collect();
    let results = state.cpu_energy.change_states(&wanted).await;

    let mut changed: Vec<usize> = Vec::new();
    let mut not_changed: Vec<usize> = Vec::new();
    for (idx, ok) in results {
        if ok {
            changed.push(idx);
        } else {
            not_changed.push(idx);
        }
    }
    changed.sort_unstable();
    not_changed.sort_unstable();

    if !not_changed.is_empty() {
        error!(
            "could not change the energy policy level to full performance for CPUs: {}",
            not_changed.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
    }
    if !changed.is_empty() {
        info!(
            "energy policy level changed to full performance for CPUs: {}",
            changed.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
        if !process.request.is_self_request() {
            let to_save: HashMap<usize, i32> = changed
                .iter()
                .filter_map(|idx| not_in_performance.get(idx).map(|state| (*idx, *state)))
                .collect();
            saved.save(&to_save);
            outcome.cpu_energy_policy_changed = true;
        }
    }
    outcome
}

async fn change_gpu_mode(state: &AppState, process: &OptimizedProcess) -> EnvOutcome {
    let mut outcome = EnvOutcome::default();
    let previous = state
        .gpus
        .activate_performance(process.user_env(), None)
        .await;
    if !previous.is_empty() {
        outcome.previous_gpu_states = Some(previous);
    }
    outcome
}
