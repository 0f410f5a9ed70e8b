//! Dead-process watcher: samples the live pid set on an interval, folds dead
//! entries into a restore plan and executes it. The loop runs only while at
//! least one process is watched.

use crate::optimizer::OptimizedProcess;
use crate::restore;
use crate::state::AppState;
use crate::summary::{self, GlobalSnapshot};
use crate::system;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct WatchInner {
    watched: Vec<OptimizedProcess>,
    /// Process name -> command to relaunch once every dependent is gone.
    to_relaunch: HashMap<String, String>,
}

pub struct ProcessWatcher {
    check_interval: f64,
    inner: Mutex<WatchInner>,
    looping: Mutex<bool>,
}

fn update_to_relaunch(ledger: &mut HashMap<String, String>, entries: &HashMap<String, Option<String>>) {
    for (comm, cmd) in entries {
        let Some(cmd) = cmd else { continue };
        // absolute-path commands win over bare names
        let replace = ledger.get(comm).map(|cached| !cached.starts_with('/')).unwrap_or(true);
        if replace {
            ledger.insert(comm.clone(), cmd.clone());
        }
    }
}

fn register_relaunch_commands(inner: &mut WatchInner, process: &OptimizedProcess) {
    if process.relaunch_stopped_processes() {
        if let Some(stopped) = process.stopped_processes() {
            update_to_relaunch(&mut inner.to_relaunch, stopped);
        }
    }
    if process.relaunch_stopped_after_launch() {
        if let Some(stopped) = &process.stopped_after_launch {
            update_to_relaunch(&mut inner.to_relaunch, stopped);
        }
    }
}

impl ProcessWatcher {
    pub fn new(check_interval: f64) -> Self {
        Self {
            check_interval,
            inner: Mutex::new(WatchInner::default()),
            looping: Mutex::new(false),
        }
    }

    /// Transfers ownership of the process to the watcher and makes sure the
    /// sampling loop is running.
    pub async fn enroll(state: &AppState, process: OptimizedProcess) {
        let watcher = &state.watcher;
        {
            let mut inner = watcher.inner.lock().await;
            register_relaunch_commands(&mut inner, &process);
            inner.watched.push(process);
            debug!("watching a new process ({} now)", inner.watched.len());
        }

        let mut looping = watcher.looping.lock().await;
        if !*looping {
            *looping = true;
            let state = state.clone();
            tokio::spawn(async move {
                Self::run_loop(state).await;
            });
        }
    }

    pub async fn is_watching(&self) -> bool {
        *self.looping.lock().await
    }

    pub async fn watched_pids(&self) -> Vec<i32> {
        self.inner.lock().await.watched.iter().filter_map(|p| p.pid).collect()
    }

    pub async fn to_relaunch_view(&self) -> HashMap<String, String> {
        self.inner.lock().await.to_relaunch.clone()
    }

    async fn run_loop(state: AppState) {
        let watcher = state.watcher.clone();
        let interval = Duration::from_secs_f64(watcher.check_interval.max(0.1));

        loop {
            let pids_alive = system::read_current_pids();
            let globals = GlobalSnapshot {
                mouse_cursor_hidden: state.mouse.is_cursor_hidden().await,
                compositor_disabled: state.compositor.is_disabled_context_set().await,
            };

            let plan = {
                let mut inner = watcher.inner.lock().await;
                let ledger = inner.to_relaunch.clone();
                let summary = summary::summarize(&mut inner.watched, pids_alive, &ledger, &globals);

                if !summary.dead.is_empty() {
                    let dead_pids: Vec<i32> = summary.dead.iter().map(|(_, pid)| *pid).collect();
                    state.queue.remove_pids(dead_pids.iter().copied()).await;
                    for (offset, (idx, _)) in summary.dead.iter().enumerate() {
                        inner.watched.remove(idx - offset);
                    }
                    debug!(
                        "{} process(es) stopped: {}",
                        dead_pids.len(),
                        dead_pids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
                    );
                }

                let plan = summary::project(summary);

                // commands about to be relaunched (or known never stopped)
                // leave the ledger
                for (comm, _) in &plan.stopped_processes {
                    inner.to_relaunch.remove(comm);
                }
                for comm in &plan.not_stopped_processes {
                    inner.to_relaunch.remove(comm);
                }
                plan
            };

            if plan.has_work() {
                restore::run_restore(&state, &plan).await;
            }

            {
                let inner = watcher.inner.lock().await;
                if inner.watched.is_empty() {
                    let mut looping = watcher.looping.lock().await;
                    *looping = false;
                    break;
                }
            }

            tokio::time::sleep(interval).await;
        }

        debug!("no processes to watch. Stopped watching");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::profile::map_profile;
    use crate::request::OptimizationRequest;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn dead_enrollee_is_retired_and_the_loop_stops() {
        let config = AgentConfig {
            check_finished_interval: 0.2,
            ..Default::default()
        };
        let state = crate::state::AppState::new(config, None);

        let dead_pid = i32::MAX - 2;
        state.queue.add_pid(dead_pid).await;

        let request = OptimizationRequest {
            pid: Some(dead_pid),
            command: Some("/usr/bin/app".to_string()),
            user_name: Some("player".to_string()),
            user_id: Some(1000),
            ..Default::default()
        };
        let profile = Arc::new(map_profile("scripts.finish=true", None, None));
        let process =
            crate::optimizer::OptimizedProcess::new(Arc::new(request), 1.0, Some(profile));
        assert!(process.should_be_watched());

        ProcessWatcher::enroll(&state, process).await;

        let mut stopped = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !state.watcher.is_watching().await {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "watcher loop did not exit");
        assert!(state.watcher.watched_pids().await.is_empty());
        assert!(!state.queue.contains(dead_pid).await);
    }

    #[test]
    fn absolute_path_commands_win_the_ledger() {
        let mut ledger = HashMap::new();
        update_to_relaunch(
            &mut ledger,
            &HashMap::from([("picom".to_string(), Some("picom".to_string()))]),
        );
        assert_eq!(ledger.get("picom").map(String::as_str), Some("picom"));

        update_to_relaunch(
            &mut ledger,
            &HashMap::from([("picom".to_string(), Some("/usr/bin/picom".to_string()))]),
        );
        assert_eq!(ledger.get("picom").map(String::as_str), Some("/usr/bin/picom"));

        // an absolute path is not downgraded back to a bare name
        update_to_relaunch(
            &mut ledger,
            &HashMap::from([("picom".to_string(), Some("picom".to_string()))]),
        );
        assert_eq!(ledger.get("picom").map(String::as_str), Some("/usr/bin/picom"));
    }

    #[test]
    fn unknown_commands_are_not_registered() {
        let mut ledger = HashMap::new();
        update_to_relaunch(&mut ledger, &HashMap::from([("ghost".to_string(), None)]));
        assert!(ledger.is_empty());
    }
}
