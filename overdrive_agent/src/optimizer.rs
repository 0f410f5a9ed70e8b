//! The request pipeline: liveness gate, profile resolution, concurrent task
//! execution, watcher enrollment.

use crate::conf;
use crate::cpu::GovernorMap;
use crate::gpu::{GpuState, GpuVendor};
use crate::launcher::LauncherMapperManager;
use crate::profile::{self, OptimizationProfile, ScriptSettings, DEFAULT_PROFILE};
use crate::request::{now_ts, OptimizationRequest};
use crate::state::AppState;
use crate::system;
use crate::tasks::EnvOutcome;
use crate::watch::ProcessWatcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A process being optimized, with every piece of restorable state captured
/// on its behalf. Owned by the handler until watcher enrollment.
#[derive(Debug, Clone)]
pub struct OptimizedProcess {
    pub request: Arc<OptimizationRequest>,
    pub profile: Option<Arc<OptimizationProfile>>,
    pub created_at: f64,
    /// May be overwritten by launcher mapping; the request keeps the source.
    pub pid: Option<i32>,
    pub related_pids: HashSet<i32>,
    pub previous_governors: Option<GovernorMap>,
    pub previous_gpu_states: Option<HashMap<GpuVendor, HashSet<GpuState>>>,
    pub cpu_energy_policy_changed: bool,
    pub stopped_after_launch: Option<HashMap<String, Option<String>>>,
    pub alive: bool,
}

impl OptimizedProcess {
    pub fn new(
        request: Arc<OptimizationRequest>,
        created_at: f64,
        profile: Option<Arc<OptimizationProfile>>,
    ) -> Self {
        Self {
            pid: request.pid,
            related_pids: request.related_pids.clone().unwrap_or_default(),
            request,
            profile,
            created_at,
            previous_governors: None,
            previous_gpu_states: None,
            cpu_energy_policy_changed: false,
            stopped_after_launch: None,
            alive: true,
        }
    }

    pub fn source_pid(&self) -> Option<i32> {
        self.request.pid
    }

    pub fn user_id(&self) -> Option<u32> {
        self.request.user_id
    }

    pub fn user_env(&self) -> Option<&HashMap<String, String>> {
        self.request.user_env.as_ref()
    }

    pub fn post_scripts(&self) -> Option<&ScriptSettings> {
        self.profile.as_deref().and_then(|p| p.finish_scripts.as_ref())
    }

    pub fn stopped_processes(&self) -> Option<&HashMap<String, Option<String>>> {
        self.request.stopped_processes.as_ref()
    }

    pub fn relaunch_stopped_processes(&self) -> bool {
        self.request.relaunch_stopped_processes == Some(true)
    }

    pub fn relaunch_stopped_after_launch(&self) -> bool {
        self.profile
            .as_deref()
            .and_then(|p| p.stop_after.as_ref())
            .and_then(|s| s.relaunch)
            == Some(true)
    }

    pub fn requires_mouse_hidden(&self) -> bool {
        self.profile.as_deref().and_then(|p| p.hide_mouse) == Some(true)
    }

    pub fn requires_compositor_disabled(&self) -> bool {
        self.profile
            .as_deref()
            .and_then(|p| p.compositor.as_ref())
            .and_then(|c| c.off)
            == Some(true)
    }

    /// The process must be watched iff it carries restorable state or a
    /// side effect that needs a reference-count decrement on death.
    pub fn should_be_watched(&self) -> bool {
        self.pid.is_some()
            && (!self.related_pids.is_empty()
                || self.previous_governors.is_some()
                || self.previous_gpu_states.is_some()
                || self.post_scripts().is_some()
                || self.requires_compositor_disabled()
                || self.stopped_processes().is_some_and(|s| !s.is_empty())
                || self.requires_mouse_hidden()
                || self.stopped_after_launch.as_ref().is_some_and(|s| !s.is_empty())
                || self.cpu_energy_policy_changed)
    }

    /// Source and mapped pids, deduplicated.
    pub fn get_pids(&self) -> HashSet<i32> {
        let mut pids = HashSet::new();
        if let Some(pid) = self.pid {
            pids.insert(pid);
        }
        if let Some(pid) = self.request.pid {
            pids.insert(pid);
        }
        pids
    }

    pub fn apply(&mut self, outcome: EnvOutcome) {
        if outcome.previous_governors.is_some() {
            self.previous_governors = outcome.previous_governors;
        }
        if outcome.previous_gpu_states.is_some() {
            self.previous_gpu_states = outcome.previous_gpu_states;
        }
        if outcome.cpu_energy_policy_changed {
            self.cpu_energy_policy_changed = true;
        }
        if outcome.stopped_after_launch.is_some() {
            self.stopped_after_launch = outcome.stopped_after_launch;
        }
        self.related_pids.extend(outcome.related_pids);
    }
}

pub struct OptimizationHandler {
    state: AppState,
    mapper: LauncherMapperManager,
}

impl OptimizationHandler {
    pub fn new(state: AppState) -> Self {
        let mapper = LauncherMapperManager::new(state.config.launcher_mapping_timeout);
        Self { state, mapper }
    }

    /// Parses an inline configuration into a profile; nothing applies when it
    /// carries no valid directive.
    pub fn map_valid_config(&self, config: &str) -> Option<Arc<OptimizationProfile>> {
        let normalized = if config.contains('\n') {
            Some(config.to_string())
        } else {
            conf::normalize_inline(config)
        };
        let profile = normalized.map(|c| profile::map_profile(&c, None, None));
        match profile {
            Some(profile) if profile.is_valid() => Some(Arc::new(profile)),
            _ => {
                warn!(
                    "no optimization settings defined in configuration: {}",
                    config.replace('\n', " ")
                );
                None
            }
        }
    }

    async fn read_valid_profile(
        &self,
        name: &str,
        add_settings: Option<&str>,
        request: &OptimizationRequest,
    ) -> Option<Arc<OptimizationProfile>> {
        for path in
            profile::possible_profile_paths(name, request.user_id, request.user_name.as_deref())
        {
            match self.state.profiles.read_valid(&path, add_settings).await {
                Ok(profile) => return profile,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("profile file '{}' not found (request={:?})", path.display(), request.pid);
                }
                Err(e) => {
                    warn!("could not read profile file '{}': {e}", path.display());
                    return None;
                }
            }
        }
        None
    }

    async fn load_valid_profile(
        &self,
        request: &OptimizationRequest,
    ) -> Option<Arc<OptimizationProfile>> {
        let add_settings = request.profile_config.as_deref();

        if let Some(name) = request.profile.as_deref() {
            if let Some(profile) = self.read_valid_profile(name, add_settings, request).await {
                info!(
                    "valid profile '{}' found (request={:?})",
                    profile.name.as_deref().unwrap_or(name),
                    request.pid
                );
                return Some(profile);
            }
        }

        let fallback = self
            .read_valid_profile(DEFAULT_PROFILE, add_settings, request)
            .await;
        if let Some(profile) = &fallback {
            let prefix = match request.profile.as_deref() {
                Some(name) => format!("no existing/valid profile '{name}'"),
                None => "request has no profile defined".to_string(),
            };
            warn!(
                "{prefix}. Profile '{}' will be used instead (request={:?})",
                profile.path.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
                request.pid
            );
        }
        fallback
    }

    pub async fn handle(&self, mut request: OptimizationRequest) {
        request.prepare();

        let Some(source_pid) = request.pid else {
            return;
        };
        if !system::pid_exists(source_pid) {
            warn!("process {source_pid} does not exist. No optimization will be applied");
            self.state.queue.remove_pids([source_pid]).await;
            return;
        }

        let profile = if request.has_full_configuration() {
            self.map_valid_config(request.config.as_deref().unwrap_or_default())
        } else {
            self.load_valid_profile(&request).await
        };
        if profile.is_none() {
            warn!("no optimizations available for process '{source_pid}'");
        }

        let request = Arc::new(request);
        let mut process = OptimizedProcess::new(request.clone(), now_ts(), profile);

        let mut env_handles = Vec::new();
        let mut proc_handles = Vec::new();

        if let Some(profile) = process.profile.clone() {
            if let Some(registry) = self.state.tasks() {
                // environment phase: spawn concurrently, await before
                // enrollment so prior-state fields are populated
                for task in registry.runnable_env_tasks(&self.state, &process).await {
                    let state = self.state.clone();
                    let snapshot = process.clone();
                    env_handles.push(tokio::spawn(async move { task.run(&state, &snapshot).await }));
                }

                // process phase: resolve the real target pid first
                if profile.process.is_some() {
                    let proc_tasks = registry.runnable_proc_tasks(&self.state, &process).await;
                    if !proc_tasks.is_empty() {
                        if let Some(mapped) = self.mapper.map_pid(&request, &profile).await {
                            process.pid = Some(mapped);
                            self.state.queue.add_pid(mapped).await;
                        }
                        for task in proc_tasks {
                            let state = self.state.clone();
                            let snapshot = process.clone();
                            proc_handles
                                .push(tokio::spawn(async move { task.run(&state, &snapshot).await }));
                        }
                    }
                }
            }

            for handle in env_handles {
                match handle.await {
                    Ok(outcome) => process.apply(outcome),
                    Err(e) => warn!("environment task aborted: {e}"),
                }
            }
        }

        let should_be_watched = process.should_be_watched();
        if should_be_watched {
            let mapped_pid = process.pid;
            ProcessWatcher::enroll(&self.state, process.clone()).await;
            if mapped_pid != Some(source_pid) {
                self.state.queue.remove_pids([source_pid]).await;
            }
        }

        for handle in proc_handles {
            if let Err(e) = handle.await {
                warn!("process task aborted: {e}");
            }
        }

        if !should_be_watched {
            let pids = process.get_pids();
            if !pids.is_empty() {
                self.state.queue.remove_pids(pids).await;
            }
        }

        let exec_time = now_ts() - request.created_at();
        debug!(
            "optimization request for '{source_pid}' took {exec_time:.4} seconds{}",
            match process.pid {
                Some(pid) if pid != source_pid => format!(" (target_pid={pid})"),
                _ => String::new(),
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::map_profile;

    fn process_with(profile_str: &str, request: OptimizationRequest) -> OptimizedProcess {
        let profile = Arc::new(map_profile(profile_str, None, None));
        OptimizedProcess::new(Arc::new(request), 1.0, Some(profile))
    }

    fn plain_request() -> OptimizationRequest {
        OptimizationRequest {
            pid: Some(100),
            command: Some("/usr/bin/game".to_string()),
            user_name: Some("player".to_string()),
            user_id: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn watch_requires_restorable_state() {
        let bare = process_with("cpu.performance", plain_request());
        assert!(!bare.should_be_watched());

        let mut with_governors = process_with("cpu.performance", plain_request());
        with_governors.previous_governors =
            Some(GovernorMap::from([("schedutil".to_string(), [0].into())]));
        assert!(with_governors.should_be_watched());

        let with_compositor = process_with("compositor.off", plain_request());
        assert!(with_compositor.should_be_watched());

        let with_mouse = process_with("mouse.hidden", plain_request());
        assert!(with_mouse.should_be_watched());

        let with_finish = process_with("scripts.finish=/bin/restore", plain_request());
        assert!(with_finish.should_be_watched());

        let mut with_energy = process_with("cpu.performance", plain_request());
        with_energy.cpu_energy_policy_changed = true;
        assert!(with_energy.should_be_watched());

        let mut with_related = plain_request();
        with_related.related_pids = Some([7].into_iter().collect());
        assert!(process_with("cpu.performance", with_related).should_be_watched());

        let mut with_stopped = plain_request();
        with_stopped.stopped_processes =
            Some(HashMap::from([("picom".to_string(), Some("/usr/bin/picom".to_string()))]));
        assert!(process_with("cpu.performance", with_stopped).should_be_watched());
    }

    #[test]
    fn get_pids_includes_source_and_mapped() {
        let mut process = process_with("cpu.performance", plain_request());
        process.pid = Some(222);
        assert_eq!(process.get_pids(), HashSet::from([100, 222]));

        let same = process_with("cpu.performance", plain_request());
        assert_eq!(same.get_pids(), HashSet::from([100]));
    }

    #[test]
    fn env_outcomes_merge_into_the_record() {
        let mut process = process_with("cpu.performance\ngpu.performance", plain_request());
        process.apply(EnvOutcome {
            previous_governors: Some(GovernorMap::from([("ondemand".to_string(), [1].into())])),
            cpu_energy_policy_changed: true,
            related_pids: [9].into_iter().collect(),
            ..Default::default()
        });
        process.apply(EnvOutcome {
            related_pids: [10].into_iter().collect(),
            ..Default::default()
        });

        assert!(process.previous_governors.is_some());
        assert!(process.cpu_energy_policy_changed);
        assert_eq!(process.related_pids, HashSet::from([9, 10]));
    }
}
