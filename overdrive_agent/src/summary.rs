//! Post-process summarization: reduces the watched process list against the
//! live-pid snapshot into a single summary, then projects the summary into a
//! deterministic restore plan. Both steps are pure so they can be exercised
//! without touching the system.

use crate::cpu::GovernorMap;
use crate::gpu::{GpuState, GpuVendor};
use crate::optimizer::OptimizedProcess;
use crate::profile::ScriptSettings;
use std::collections::{HashMap, HashSet};

/// Daemon-global facts the reduction needs (read under the respective locks
/// by the watcher before summarizing).
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalSnapshot {
    pub mouse_cursor_hidden: Option<bool>,
    pub compositor_disabled: bool,
}

#[derive(Debug, Default)]
pub struct PostSummary {
    pub pids_alive: HashSet<i32>,
    /// Indices (in enrollment order) and pids of processes found dead.
    pub dead: Vec<(usize, i32)>,
    pub user_id: Option<u32>,
    pub user_env: Option<HashMap<String, String>>,
    pub pids_to_stop: HashSet<i32>,
    pub keep_compositor_disabled: bool,
    pub restore_compositor: bool,
    pub finish_scripts: Vec<(f64, ScriptSettings)>,
    pub previous_governor_maps: Vec<GovernorMap>,
    pub cpus_in_use: bool,
    pub keep_cpu_energy_policy: bool,
    pub restore_cpu_energy_policy: bool,
    pub previous_gpu_states: HashMap<GpuVendor, Vec<GpuState>>,
    pub gpus_in_use: HashMap<GpuVendor, HashSet<String>>,
    pub keep_mouse_hidden: bool,
    pub restore_mouse_cursor: bool,
    pub relaunch_by_time: Vec<(f64, HashMap<String, Option<String>>)>,
    pub processes_not_relaunch: HashSet<String>,
    pub processes_to_relaunch: HashMap<String, String>,
}

fn push_bucket(
    buckets: &mut Vec<(f64, HashMap<String, Option<String>>)>,
    created_at: f64,
    entries: HashMap<String, Option<String>>,
) {
    match buckets.iter_mut().find(|(time, _)| *time == created_at) {
        Some((_, bucket)) => bucket.extend(entries),
        None => buckets.push((created_at, entries)),
    }
}

fn fill_relaunch(
    summary: &mut PostSummary,
    created_at: f64,
    alive: bool,
    processes: &HashMap<String, Option<String>>,
    relaunch: bool,
) {
    if alive {
        summary.processes_not_relaunch.extend(processes.keys().cloned());
        return;
    }
    if relaunch {
        // prefer the watcher's ledger command: the request side may not have
        // known the command because the process was already dead
        let bucket = processes
            .iter()
            .map(|(comm, cmd)| {
                let best = summary
                    .processes_to_relaunch
                    .get(comm)
                    .map(|c| Some(c.clone()))
                    .unwrap_or_else(|| cmd.clone());
                (comm.clone(), best)
            })
            .collect();
        push_bucket(&mut summary.relaunch_by_time, created_at, bucket);
    } else if !summary.processes_to_relaunch.is_empty() {
        let bucket: HashMap<String, Option<String>> = processes
            .iter()
            .filter(|(comm, _)| summary.processes_to_relaunch.contains_key(*comm))
            .map(|(comm, cmd)| (comm.clone(), cmd.clone()))
            .collect();
        if !bucket.is_empty() {
            push_bucket(&mut summary.relaunch_by_time, created_at, bucket);
        }
    }
}

/// Flips `alive` on processes missing from the snapshot and reduces every
/// process (alive or dead) into the summary, in enrollment order.
pub fn summarize(
    processes: &mut [OptimizedProcess],
    pids_alive: HashSet<i32>,
    processes_to_relaunch: &HashMap<String, String>,
    globals: &GlobalSnapshot,
) -> PostSummary {
    let mut summary = PostSummary {
        pids_alive,
        processes_to_relaunch: processes_to_relaunch.clone(),
        ..Default::default()
    };

    for (idx, process) in processes.iter_mut().enumerate() {
        let pid_alive = process.pid.is_some_and(|pid| summary.pids_alive.contains(&pid));
        if !pid_alive {
            process.alive = false;
            summary.dead.push((idx, process.pid.unwrap_or(-1)));
        }

        // last dead process wins; environments merge
        if !process.alive {
            if let Some(user_id) = process.user_id() {
                summary.user_id = Some(user_id);
            }
            if let Some(env) = process.user_env() {
                summary.user_env.get_or_insert_with(HashMap::new).extend(env.clone());
            }
            if !process.related_pids.is_empty() {
                for pid in &process.related_pids {
                    if summary.pids_alive.contains(pid) {
                        summary.pids_to_stop.insert(*pid);
                    }
                }
            }
        }

        if process.requires_compositor_disabled() {
            if process.alive {
                summary.keep_compositor_disabled = true;
            } else if globals.compositor_disabled {
                summary.restore_compositor = true;
            }
        }

        if !process.alive {
            if let Some(scripts) = process.post_scripts() {
                summary.finish_scripts.push((process.created_at, scripts.clone()));
            }
        }

        if let Some(governors) = &process.previous_governors {
            if process.alive {
                summary.cpus_in_use = true;
            } else {
                summary.previous_governor_maps.push(governors.clone());
            }
        }

        if process.cpu_energy_policy_changed {
            if process.alive {
                summary.keep_cpu_energy_policy = true;
            } else {
                summary.restore_cpu_energy_policy = true;
            }
        }

        if let Some(gpu_states) = &process.previous_gpu_states {
            for (vendor, states) in gpu_states {
                if process.alive {
                    summary
                        .gpus_in_use
                        .entry(*vendor)
                        .or_default()
                        .extend(states.iter().map(|s| s.id.clone()));
                } else {
                    summary
                        .previous_gpu_states
                        .entry(*vendor)
                        .or_default()
                        .extend(states.iter().cloned());
                }
            }
        }

        if let Some(stopped) = process.stopped_processes() {
            let relaunch = process.relaunch_stopped_processes();
            fill_relaunch(&mut summary, process.created_at, process.alive, stopped, relaunch);
        }
        if let Some(stopped) = process.stopped_after_launch.clone() {
            let relaunch = process.relaunch_stopped_after_launch();
            fill_relaunch(&mut summary, process.created_at, process.alive, &stopped, relaunch);
        }

        if process.requires_mouse_hidden() {
            if process.alive {
                summary.keep_mouse_hidden = true;
            } else if globals.mouse_cursor_hidden == Some(true) {
                summary.restore_mouse_cursor = true;
            }
        }
    }

    summary.dead.sort_unstable_by_key(|(idx, _)| *idx);
    summary
}

/// The deterministic projection of a summary into restore operations.
#[derive(Debug, Default)]
pub struct RestorePlan {
    pub restorable_cpus: Vec<GovernorMap>,
    pub restorable_gpus: HashMap<GpuVendor, Vec<GpuState>>,
    pub pids_to_stop: HashSet<i32>,
    pub scripts: Vec<ScriptSettings>,
    pub user_id: Option<u32>,
    pub user_env: Option<HashMap<String, String>>,
    pub restore_compositor: bool,
    pub restore_mouse_cursor: bool,
    pub restore_cpu_energy_policy: bool,
    pub stopped_processes: Vec<(String, String)>,
    pub not_stopped_processes: HashSet<String>,
}

impl RestorePlan {
    pub fn has_work(&self) -> bool {
        !self.restorable_cpus.is_empty()
            || !self.restorable_gpus.is_empty()
            || !self.pids_to_stop.is_empty()
            || !self.scripts.is_empty()
            || self.restore_compositor
            || self.restore_mouse_cursor
            || self.restore_cpu_energy_policy
            || !self.stopped_processes.is_empty()
    }
}

pub fn project(summary: PostSummary) -> RestorePlan {
    let mut plan = RestorePlan {
        user_id: summary.user_id,
        user_env: summary.user_env,
        pids_to_stop: summary.pids_to_stop,
        restore_compositor: !summary.keep_compositor_disabled && summary.restore_compositor,
        restore_mouse_cursor: !summary.keep_mouse_hidden && summary.restore_mouse_cursor,
        restore_cpu_energy_policy: !summary.keep_cpu_energy_policy
            && summary.restore_cpu_energy_policy,
        ..Default::default()
    };

    if !summary.cpus_in_use {
        plan.restorable_cpus = summary.previous_governor_maps;
    }

    // GPUs still held by an alive process are excluded; a driver whose every
    // GPU is in use is dropped entirely
    for (vendor, states) in summary.previous_gpu_states {
        let in_use = summary.gpus_in_use.get(&vendor);
        let restorable: Vec<GpuState> = match in_use {
            Some(ids) => states.into_iter().filter(|s| !ids.contains(&s.id)).collect(),
            None => states,
        };
        if !restorable.is_empty() {
            plan.restorable_gpus.insert(vendor, restorable);
        }
    }

    let mut scripts = summary.finish_scripts;
    scripts.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    plan.scripts = scripts
        .into_iter()
        .map(|(_, settings)| settings)
        .filter(|s| !s.scripts.is_empty())
        .collect();

    let mut buckets = summary.relaunch_by_time;
    buckets.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut unique: HashSet<(String, String)> = HashSet::new();
    let mut stopped_names: HashSet<String> = HashSet::new();
    let mut not_stopped: HashSet<String> = HashSet::new();
    for (_, bucket) in buckets {
        let mut entries: Vec<(String, Option<String>)> = bucket.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (comm, cmd) in entries {
            if summary.processes_not_relaunch.contains(&comm) {
                continue;
            }
            match cmd {
                None => {
                    not_stopped.insert(comm);
                }
                Some(cmd) => {
                    let key = (comm.clone(), cmd.clone());
                    if unique.insert(key) {
                        stopped_names.insert(comm.clone());
                        plan.stopped_processes.push((comm, cmd));
                    }
                }
            }
        }
    }
    plan.not_stopped_processes = not_stopped.difference(&stopped_names).cloned().collect();

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{NvidiaPowerMode, PowerMode};
    use crate::profile::map_profile;
    use crate::request::OptimizationRequest;
    use std::sync::Arc;

    fn process(pid: i32, created_at: f64, profile_str: &str) -> OptimizedProcess {
        let request = OptimizationRequest {
            pid: Some(pid),
            command: Some(format!("/usr/bin/app{pid}")),
            user_name: Some("player".to_string()),
            user_id: Some(1000),
            ..Default::default()
        };
        let profile = Arc::new(map_profile(profile_str, None, None));
        OptimizedProcess::new(Arc::new(request), created_at, Some(profile))
    }

    fn governors(entries: &[(&str, &[usize])]) -> GovernorMap {
        entries
            .iter()
            .map(|(gov, cpus)| (gov.to_string(), cpus.iter().copied().collect()))
            .collect()
    }

    fn gpu_state(vendor: GpuVendor, id: &str, mode: PowerMode) -> GpuState {
        GpuState {
            id: id.to_string(),
            vendor,
            power_mode: mode,
        }
    }

    #[test]
    fn governor_restore_waits_for_the_last_holder() {
        // request A captured the prior governors; B overlaps with the same
        // requirement but captured the shared saved map
        let saved = governors(&[("schedutil", &[0]), ("ondemand", &[1])]);
        let mut a = process(1, 1.0, "cpu.performance");
        a.previous_governors = Some(saved.clone());
        let mut b = process(2, 2.0, "cpu.performance");
        b.previous_governors = Some(saved.clone());

        // A dies, B alive: nothing restorable
        let mut watched = vec![a, b];
        let summary = summarize(
            &mut watched,
            HashSet::from([2]),
            &HashMap::new(),
            &GlobalSnapshot::default(),
        );
        assert!(summary.cpus_in_use);
        assert_eq!(summary.dead, vec![(0, 1)]);
        let plan = project(summary);
        assert!(plan.restorable_cpus.is_empty());

        // B dies afterwards: the saved mapping is restorable
        watched.remove(0);
        let summary = summarize(
            &mut watched,
            HashSet::new(),
            &HashMap::new(),
            &GlobalSnapshot::default(),
        );
        let plan = project(summary);
        assert_eq!(plan.restorable_cpus, vec![saved]);
    }

    #[test]
    fn gpu_overlap_partitions_by_gpu_id() {
        let nvidia0 = gpu_state(GpuVendor::Nvidia, "0", PowerMode::Nvidia(NvidiaPowerMode::Auto));
        let amd1 = gpu_state(GpuVendor::Amd, "1", PowerMode::Amd("auto:3".to_string()));

        let mut a = process(1, 1.0, "gpu.performance");
        a.previous_gpu_states = Some(HashMap::from([
            (GpuVendor::Nvidia, HashSet::from([nvidia0.clone()])),
            (GpuVendor::Amd, HashSet::from([amd1.clone()])),
        ]));
        let mut b = process(2, 2.0, "gpu.performance");
        b.previous_gpu_states =
            Some(HashMap::from([(GpuVendor::Nvidia, HashSet::from([nvidia0.clone()]))]));

        // A dies while B (holding NVIDIA "0") is alive: only AMD "1" restores
        let mut watched = vec![a, b];
        let summary = summarize(
            &mut watched,
            HashSet::from([2]),
            &HashMap::new(),
            &GlobalSnapshot::default(),
        );
        let plan = project(summary);
        assert!(!plan.restorable_gpus.contains_key(&GpuVendor::Nvidia));
        assert_eq!(
            plan.restorable_gpus.get(&GpuVendor::Amd).map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn compositor_held_by_alive_process_is_kept() {
        let globals = GlobalSnapshot {
            compositor_disabled: true,
            ..Default::default()
        };
        let a = process(1, 1.0, "compositor.off");
        let b = process(2, 2.0, "compositor.off");

        let mut watched = vec![a, b];
        let summary = summarize(&mut watched, HashSet::from([2]), &HashMap::new(), &globals);
        assert!(summary.keep_compositor_disabled);
        assert!(summary.restore_compositor);
        let plan = project(summary);
        assert!(!plan.restore_compositor);

        watched.remove(0);
        let summary = summarize(&mut watched, HashSet::new(), &HashMap::new(), &globals);
        let plan = project(summary);
        assert!(plan.restore_compositor);
    }

    #[test]
    fn mouse_restore_requires_daemon_ownership() {
        let owned = GlobalSnapshot {
            mouse_cursor_hidden: Some(true),
            ..Default::default()
        };
        let external = GlobalSnapshot {
            mouse_cursor_hidden: Some(false),
            ..Default::default()
        };

        let mut watched = vec![process(1, 1.0, "mouse.hidden")];
        let summary = summarize(&mut watched, HashSet::new(), &HashMap::new(), &owned);
        assert!(project(summary).restore_mouse_cursor);

        let mut watched = vec![process(1, 1.0, "mouse.hidden")];
        let summary = summarize(&mut watched, HashSet::new(), &HashMap::new(), &external);
        assert!(!project(summary).restore_mouse_cursor);
    }

    #[test]
    fn relaunch_plan_distinguishes_never_stopped_processes() {
        let mut request = OptimizationRequest {
            pid: Some(1),
            command: Some("/usr/bin/game".to_string()),
            user_name: Some("root".to_string()),
            user_id: Some(0),
            ..Default::default()
        };
        request.stopped_processes = Some(HashMap::from([
            ("foo".to_string(), Some("/bin/foo".to_string())),
            ("bar".to_string(), None),
        ]));
        request.relaunch_stopped_processes = Some(true);
        let process = OptimizedProcess::new(
            Arc::new(request),
            1.0,
            Some(Arc::new(map_profile("cpu.performance", None, None))),
        );

        let mut watched = vec![process];
        let summary = summarize(
            &mut watched,
            HashSet::new(),
            &HashMap::new(),
            &GlobalSnapshot::default(),
        );
        let plan = project(summary);
        assert_eq!(plan.stopped_processes, vec![("foo".to_string(), "/bin/foo".to_string())]);
        assert_eq!(plan.not_stopped_processes, HashSet::from(["bar".to_string()]));
        assert_eq!(plan.user_id, Some(0));
    }

    #[test]
    fn ledger_command_beats_request_command() {
        let mut request = OptimizationRequest {
            pid: Some(1),
            command: Some("/usr/bin/game".to_string()),
            user_name: Some("player".to_string()),
            user_id: Some(1000),
            ..Default::default()
        };
        request.stopped_processes = Some(HashMap::from([("picom".to_string(), None)]));
        request.relaunch_stopped_processes = Some(true);
        let process = OptimizedProcess::new(
            Arc::new(request),
            1.0,
            Some(Arc::new(map_profile("cpu.performance", None, None))),
        );

        let ledger = HashMap::from([("picom".to_string(), "/usr/bin/picom".to_string())]);
        let mut watched = vec![process];
        let summary = summarize(&mut watched, HashSet::new(), &ledger, &GlobalSnapshot::default());
        let plan = project(summary);
        assert_eq!(
            plan.stopped_processes,
            vec![("picom".to_string(), "/usr/bin/picom".to_string())]
        );
        assert!(plan.not_stopped_processes.is_empty());
    }

    #[test]
    fn second_pass_with_same_snapshot_is_idempotent() {
        let mut a = process(1, 1.0, "cpu.performance\nmouse.hidden");
        a.previous_governors = Some(governors(&[("schedutil", &[0])]));
        let globals = GlobalSnapshot {
            mouse_cursor_hidden: Some(true),
            ..Default::default()
        };

        let mut watched = vec![a];
        let summary = summarize(&mut watched, HashSet::new(), &HashMap::new(), &globals);
        let dead: Vec<usize> = summary.dead.iter().map(|(idx, _)| *idx).collect();
        let plan = project(summary);
        assert!(plan.has_work());

        // dead entries removed, second iteration sees no watched processes
        for idx in dead.into_iter().rev() {
            watched.remove(idx);
        }
        let summary = summarize(&mut watched, HashSet::new(), &HashMap::new(), &globals);
        let plan = project(summary);
        assert!(!plan.has_work());
    }

    #[test]
    fn dead_user_env_merges_with_last_writer_wins() {
        let mut a = process(1, 1.0, "cpu.performance");
        Arc::get_mut(&mut a.request).unwrap().user_env =
            Some(HashMap::from([("DISPLAY".to_string(), ":0".to_string())]));
        let mut b = process(2, 2.0, "cpu.performance");
        Arc::get_mut(&mut b.request).unwrap().user_env = Some(HashMap::from([
            ("DISPLAY".to_string(), ":1".to_string()),
            ("XAUTHORITY".to_string(), "/tmp/xauth".to_string()),
        ]));

        let mut watched = vec![a, b];
        let summary = summarize(
            &mut watched,
            HashSet::new(),
            &HashMap::new(),
            &GlobalSnapshot::default(),
        );
        let env = summary.user_env.unwrap();
        assert_eq!(env.get("DISPLAY").map(String::as_str), Some(":1"));
        assert_eq!(env.get("XAUTHORITY").map(String::as_str), Some("/tmp/xauth"));
    }
}
