//! Restore task engine: executes a `RestorePlan` in its fixed order:
//! compositor, related-process kills, mouse cursor, GPU modes, CPU governors,
//! CPU energy levels, relaunches, finish scripts.

use crate::cpu::GovernorMap;
use crate::gpu::PowerMode;
use crate::scripts::ScriptRunner;
use crate::state::AppState;
use crate::summary::RestorePlan;
use crate::system;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

static RE_PYTHON_CMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/.+/python\d*\s+(/.+)$").expect("python cmd regex"));

pub async fn run_restore(state: &AppState, plan: &RestorePlan) {
    reenable_window_compositor(state, plan).await;
    stop_related_processes(plan).await;
    restore_mouse_cursor(state, plan).await;
    restore_gpu_state(state, plan).await;
    restore_cpu_governors(state, plan).await;
    restore_cpu_energy_policy(state, plan).await;
    relaunch_stopped_processes(plan).await;
    run_finish_scripts(state, plan).await;
}

async fn reenable_window_compositor(state: &AppState, plan: &RestorePlan) {
    if !plan.restore_compositor {
        return;
    }
    let mut slot = state.compositor.lock().await;
    let (Some(compositor), Some(mut context)) =
        (slot.compositor.clone(), slot.disabled_context.clone())
    else {
        return;
    };

    match compositor
        .is_enabled(plan.user_id, plan.user_env.as_ref(), &mut context)
        .await
    {
        None => error!(
            "could not re-enable the window compositor. It was not possible to determine its current state"
        ),
        Some(true) => {
            info!("it was not necessary to enable the window compositor. It is already enabled");
            slot.disabled_context = None;
        }
        Some(false) => {
            if compositor
                .enable(plan.user_id, plan.user_env.as_ref(), &context)
                .await
            {
                info!("window compositor re-enabled");
                slot.disabled_context = None;
            } else {
                error!("could not re-enable the window compositor");
            }
        }
    }
}

async fn stop_related_processes(plan: &RestorePlan) {
    if plan.pids_to_stop.is_empty() {
        return;
    }
    debug!("finding children of related processes");
    let children = system::find_children(&plan.pids_to_stop).await;

    let mut all_to_stop: Vec<String> = children.iter().map(|p| p.to_string()).collect();
    all_to_stop.extend(plan.pids_to_stop.iter().map(|p| p.to_string()));
    let targets = all_to_stop.join(" ");

    info!("stopping related processes: {targets}");
    let (code, _) = system::run_shell(&format!("kill -9 {targets}"), None).await;
    if code != 0 {
        error!("not all related processes could be stopped: {targets}");
    }
}

async fn restore_mouse_cursor(state: &AppState, plan: &RestorePlan) {
    if plan.restore_mouse_cursor {
        state.mouse.show_cursor().await;
    }
}

async fn restore_gpu_state(state: &AppState, plan: &RestorePlan) {
    for (vendor, states) in &plan.restorable_gpus {
        let Some(driver) = state.gpus.driver_for(*vendor) else {
            continue;
        };
        let _guard = driver.lock().await;

        // several prior modes can map to the same GPU; ambiguity resolves to
        // the driver default
        let mut modes_by_gpu: HashMap<String, HashSet<PowerMode>> = HashMap::new();
        for gpu_state in states {
            modes_by_gpu
                .entry(gpu_state.id.clone())
                .or_default()
                .insert(gpu_state.power_mode.clone());
        }

        let ids: BTreeSet<String> = modes_by_gpu.keys().cloned().collect();
        let current = driver
            .get_power_mode(&ids, plan.user_env.as_ref())
            .await
            .unwrap_or_default();

        let mut to_restore: HashMap<String, PowerMode> = HashMap::new();
        for (id, modes) in modes_by_gpu {
            let target = if modes.len() == 1 {
                modes.into_iter().next().unwrap_or_else(|| driver.default_mode())
            } else {
                driver.default_mode()
            };
            if current.get(&id) == Some(&target) {
                info!(
                    "it is not necessary to restore {} GPU ({id}) to '{target}' mode",
                    vendor.name()
                );
            } else {
                to_restore.insert(id, target);
            }
        }

        if to_restore.is_empty() {
            continue;
        }
        debug!(
            "restoring power mode of {} GPUs: {}",
            vendor.name(),
            to_restore.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        let changed = driver.set_power_mode(&to_restore, plan.user_env.as_ref()).await;
        let not_restored: Vec<&String> =
            changed.iter().filter(|(_, ok)| !**ok).map(|(id, _)| id).collect();
        if !not_restored.is_empty() {
            error!(
                "could not restore power mode of {} GPUs: {:?}",
                vendor.name(),
                not_restored
            );
        }
    }
}

/// Merges governor maps and, for CPUs claimed by several governors, keeps the
/// governor with the most CPUs mapped.
pub(crate) fn merge_governor_maps(maps: &[GovernorMap]) -> GovernorMap {
    let mut governor_cpus: GovernorMap = GovernorMap::new();
    let mut cpu_governors: HashMap<usize, HashSet<String>> = HashMap::new();

    for map in maps {
        for (governor, cpus) in map {
            governor_cpus.entry(governor.clone()).or_default().extend(cpus.iter().copied());
            for cpu in cpus {
                cpu_governors.entry(*cpu).or_default().insert(governor.clone());
            }
        }
    }

    if governor_cpus.len() > 1 {
        let mut ranked: Vec<(usize, String)> = governor_cpus
            .iter()
            .map(|(governor, cpus)| (cpus.len(), governor.clone()))
            .collect();
        ranked.sort_by(|a, b| b.cmp(a));
        let rank_of = |governor: &str| ranked.iter().position(|(_, g)| g == governor).unwrap_or(usize::MAX);

        for (cpu, governors) in &cpu_governors {
            if governors.len() < 2 {
                continue;
            }
            let preferred = governors
                .iter()
                .min_by_key(|governor| rank_of(governor))
                .cloned();
            for governor in governors {
                if Some(governor) != preferred.as_ref() {
                    if let Some(cpus) = governor_cpus.get_mut(governor) {
                        cpus.remove(cpu);
                    }
                }
            }
        }
        governor_cpus.retain(|_, cpus| !cpus.is_empty());
    }

    governor_cpus
}

async fn restore_cpu_governors(state: &AppState, plan: &RestorePlan) {
    if plan.restorable_cpus.is_empty() {
        return;
    }
    let saved = state.cpufreq.lock().await;

    let mut governor_cpus = merge_governor_maps(&plan.restorable_cpus);
    if governor_cpus.is_empty() {
        // previous governors could not be determined at optimization time;
        // fall back to the manager's saved mapping
        if let Some(saved_map) = saved.as_governor_map() {
            governor_cpus = merge_governor_maps(std::slice::from_ref(&saved_map));
        }
    }

    if governor_cpus.is_empty() {
        warn!("previous CPU governors could not be restored because they are unknown");
        return;
    }

    for (governor, cpus) in governor_cpus {
        if cpus.is_empty() {
            continue;
        }
        debug!(
            "restoring CPUs ({}) governors to '{governor}'",
            cpus.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
        );
        state.cpufreq.change_governor(&governor, Some(&cpus)).await;
    }
}

async fn restore_cpu_energy_policy(state: &AppState, plan: &RestorePlan) {
    if !plan.restore_cpu_energy_policy {
        return;
    }
    let mut saved = state.cpu_energy.lock().await;
    let saved_state = saved.view();
    if saved_state.is_empty() {
        info!("no CPU energy policy level saved state to restore");
        return;
    }

    let mut sorted: Vec<(usize, i32)> = saved_state.iter().map(|(i, s)| (*i, *s)).collect();
    sorted.sort_unstable();
    info!(
        "restoring CPUs energy policy levels: {}",
        sorted.iter().map(|(i, s)| format!("{i}={s}")).collect::<Vec<_>>().join(", ")
    );

    let changed = state.cpu_energy.change_states(&saved_state).await;
    if changed.is_empty() {
        error!("could not restore CPUs energy policy levels");
        return;
    }

    let mut restored: Vec<usize> = Vec::new();
    let mut not_restored: Vec<usize> = Vec::new();
    for (idx, ok) in changed {
        if ok {
            restored.push(idx);
        } else {
            not_restored.push(idx);
        }
    }
    restored.sort_unstable();
    not_restored.sort_unstable();

    if !not_restored.is_empty() {
        warn!(
            "could not restore the energy policy levels of the following CPUs: {}",
            not_restored.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
    }
    if !restored.is_empty() {
        saved.clear(&restored);
        debug!(
            "saved CPUs energy policy levels cleared: {}",
            restored.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
    }
}

async fn relaunch_stopped_processes(plan: &RestorePlan) {
    if plan.stopped_processes.is_empty() {
        return;
    }
    let Some(user_id) = plan.user_id else {
        return;
    };

    let self_is_root = nix::unistd::Uid::current().is_root();
    let root_request = user_id == 0;

    if !self_is_root && root_request {
        warn!(
            "it will not be possible to launch the following root processes: {}",
            plan.stopped_processes.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>().join(", ")
        );
        return;
    }

    let commands: HashSet<String> =
        plan.stopped_processes.iter().map(|(_, cmd)| cmd.clone()).collect();
    let running = system::find_processes_by_command(&commands).await;

    for (name, cmd) in &plan.stopped_processes {
        if running.contains_key(cmd) {
            warn!("process '{name}' ({cmd}) is alive. Skipping its relaunching");
            continue;
        }

        // interpreter wrappers relaunch through the script itself
        let real_cmd = RE_PYTHON_CMD
            .captures(cmd)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(cmd);

        if self_is_root && !root_request {
            let (pid, _, _) =
                system::run_user_command(real_cmd, user_id, plan.user_env.as_ref(), false).await;
            match pid {
                Some(_) => info!("process '{name}' ({real_cmd}) relaunched (user={user_id})"),
                None => warn!("could not relaunch process '{name}' ({real_cmd}) [user={user_id}]"),
            }
        } else {
            match system::spawn_shell(real_cmd, None).await {
                Some(_) => info!("process '{name}' ({real_cmd}) relaunched"),
                None => warn!("could not relaunch process '{name}' ({real_cmd})"),
            }
        }
    }
}

async fn run_finish_scripts(state: &AppState, plan: &RestorePlan) {
    if plan.scripts.is_empty() {
        return;
    }
    let runner = ScriptRunner::new("finish", state.config.allow_root_scripts);
    runner
        .run(&plan.scripts, plan.user_id, plan.user_env.as_ref())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[usize])]) -> GovernorMap {
        entries
            .iter()
            .map(|(gov, cpus)| (gov.to_string(), cpus.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn merging_unions_disjoint_maps() {
        let merged = merge_governor_maps(&[
            map(&[("schedutil", &[0])]),
            map(&[("ondemand", &[1])]),
        ]);
        assert_eq!(merged, map(&[("schedutil", &[0]), ("ondemand", &[1])]));
    }

    #[test]
    fn conflicting_cpu_goes_to_the_largest_governor() {
        // cpu1 claimed by both; schedutil holds more CPUs overall
        let merged = merge_governor_maps(&[
            map(&[("schedutil", &[0, 1, 2])]),
            map(&[("ondemand", &[1, 3])]),
        ]);
        assert_eq!(merged.get("schedutil"), Some(&[0, 1, 2].into()));
        assert_eq!(merged.get("ondemand"), Some(&[3].into()));
    }

    #[test]
    fn governor_emptied_by_conflicts_is_dropped() {
        let merged = merge_governor_maps(&[
            map(&[("schedutil", &[0, 1])]),
            map(&[("ondemand", &[0, 1])]),
        ]);
        // tie on size: deterministic winner takes both CPUs, loser is dropped
        assert_eq!(merged.len(), 1);
        let cpus: BTreeSet<usize> = merged.values().next().unwrap().clone();
        assert_eq!(cpus, BTreeSet::from([0, 1]));
    }

    #[test]
    fn python_wrapper_commands_are_unwrapped() {
        let caps = RE_PYTHON_CMD.captures("/usr/bin/python3 /opt/tool/daemon.py").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "/opt/tool/daemon.py");
        assert!(RE_PYTHON_CMD.captures("/usr/bin/tool --flag").is_none());
    }
}
