//! Optimization profiles: the bag of directives a request resolves to.
//! Profiles are line-oriented files (`<name>.profile`) looked up in the
//! requesting user's config dir first, then `/etc/overdrive`.

use crate::conf;
use crate::config::APP_NAME;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    Other,
    Batch,
    Idle,
    Fifo,
    Rr,
}

impl SchedPolicy {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "other" => Some(Self::Other),
            "batch" => Some(Self::Batch),
            "idle" => Some(Self::Idle),
            "fifo" => Some(Self::Fifo),
            "rr" => Some(Self::Rr),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Other => "OTHER",
            Self::Batch => "BATCH",
            Self::Idle => "IDLE",
            Self::Fifo => "FIFO",
            Self::Rr => "RR",
        }
    }

    pub fn requires_priority(&self) -> bool {
        matches!(self, Self::Fifo | Self::Rr)
    }

    pub fn requires_root(&self) -> bool {
        matches!(self, Self::Fifo | Self::Rr)
    }

    pub fn to_raw(self) -> libc::c_int {
        match self {
            Self::Other => libc::SCHED_OTHER,
            Self::Batch => libc::SCHED_BATCH,
            Self::Idle => libc::SCHED_IDLE,
            Self::Fifo => libc::SCHED_FIFO,
            Self::Rr => libc::SCHED_RR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoClass {
    None,
    Realtime,
    BestEffort,
    Idle,
}

impl IoClass {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "realtime" => Some(Self::Realtime),
            "best_effort" => Some(Self::BestEffort),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Realtime => "REALTIME",
            Self::BestEffort => "BEST_EFFORT",
            Self::Idle => "IDLE",
        }
    }

    /// The `-c` value `ionice` expects.
    pub fn ionice_class(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Realtime => 1,
            Self::BestEffort => 2,
            Self::Idle => 3,
        }
    }

    pub fn supports_priority(&self) -> bool {
        matches!(self, Self::Realtime | Self::BestEffort)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuSettings {
    pub performance: Option<bool>,
}

impl CpuSettings {
    fn is_valid(&self) -> bool {
        self.performance.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuSettings {
    pub performance: Option<bool>,
}

impl GpuSettings {
    fn is_valid(&self) -> bool {
        self.performance.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositorSettings {
    pub off: Option<bool>,
}

impl CompositorSettings {
    fn is_valid(&self) -> bool {
        self.off == Some(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NiceSettings {
    pub level: Option<i32>,
    pub delay: Option<f64>,
    pub watch: Option<bool>,
}

impl NiceSettings {
    pub fn has_valid_level(&self) -> bool {
        self.level.is_some_and(|l| (-20..=19).contains(&l))
    }

    fn is_valid(&self) -> bool {
        self.has_valid_level()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulingSettings {
    pub policy: Option<SchedPolicy>,
    pub priority: Option<i32>,
}

impl SchedulingSettings {
    pub fn has_valid_priority(&self) -> bool {
        self.policy.is_some_and(|p| p.requires_priority())
            && self.priority.is_some_and(|p| (1..=99).contains(&p))
    }

    fn is_valid(&self) -> bool {
        self.policy.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoSettings {
    pub class: Option<IoClass>,
    pub nice: Option<i32>,
}

impl IoSettings {
    pub fn has_valid_priority(&self) -> bool {
        self.nice.is_some_and(|n| (0..=7).contains(&n))
    }

    fn is_valid(&self) -> bool {
        self.class.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSettings {
    pub nice: Option<NiceSettings>,
    pub affinity: Option<Vec<usize>>,
    pub scheduling: Option<SchedulingSettings>,
    pub io: Option<IoSettings>,
}

impl ProcessSettings {
    pub fn has_valid_cpu_affinity(&self, cpu_count: usize) -> bool {
        if cpu_count == 0 {
            return false;
        }
        match &self.affinity {
            Some(cpus) if !cpus.is_empty() => cpus.iter().all(|idx| *idx < cpu_count),
            _ => false,
        }
    }

    fn reset_invalid(&mut self) {
        if self.nice.as_ref().is_some_and(|n| !n.is_valid()) {
            self.nice = None;
        }
        if self.scheduling.as_ref().is_some_and(|s| !s.is_valid()) {
            self.scheduling = None;
        }
        if self.io.as_ref().is_some_and(|io| !io.is_valid()) {
            self.io = None;
        }
        if self.affinity.as_ref().is_some_and(|a| a.is_empty()) {
            self.affinity = None;
        }
    }

    fn is_valid(&self) -> bool {
        self.affinity.is_some()
            || self.nice.is_some()
            || self.scheduling.is_some()
            || self.io.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LauncherSettings {
    pub mapping: Option<HashMap<String, String>>,
    pub skip_mapping: Option<bool>,
}

impl LauncherSettings {
    fn is_valid(&self) -> bool {
        self.mapping.as_ref().is_some_and(|m| !m.is_empty()) || self.skip_mapping.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptSettings {
    pub scripts: Vec<String>,
    pub wait_execution: bool,
    pub timeout: Option<f64>,
    pub run_as_root: bool,
}

impl ScriptSettings {
    pub fn has_valid_timeout(&self) -> bool {
        self.timeout.is_some_and(|t| t > 0.0)
    }

    fn is_valid(&self) -> bool {
        !self.scripts.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopSettings {
    pub processes: HashSet<String>,
    pub relaunch: Option<bool>,
}

impl StopSettings {
    fn is_valid(&self) -> bool {
        !self.processes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationProfile {
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub cpu: Option<CpuSettings>,
    pub gpu: Option<GpuSettings>,
    pub steam: Option<bool>,
    pub hide_mouse: Option<bool>,
    pub compositor: Option<CompositorSettings>,
    pub process: Option<ProcessSettings>,
    pub launcher: Option<LauncherSettings>,
    pub after_scripts: Option<ScriptSettings>,
    pub finish_scripts: Option<ScriptSettings>,
    pub stop_after: Option<StopSettings>,
}

impl OptimizationProfile {
    pub fn is_valid(&self) -> bool {
        self.cpu.is_some()
            || self.gpu.is_some()
            || self.compositor.is_some()
            || self.process.is_some()
            || self.launcher.is_some()
            || self.after_scripts.is_some()
            || self.finish_scripts.is_some()
            || self.stop_after.is_some()
            || self.steam.is_some()
            || self.hide_mouse.is_some()
    }

    pub fn from_config(&self) -> bool {
        self.path.is_none()
    }

    pub fn log_str(&self) -> String {
        if self.from_config() {
            "informed configuration".to_string()
        } else {
            format!("profile '{}'", self.name.as_deref().unwrap_or("?"))
        }
    }

    fn set_path(&mut self, path: Option<&Path>) {
        self.path = path.map(|p| p.to_path_buf());
        self.name = path
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());
    }

    fn reset_invalid_sections(&mut self) {
        if let Some(process) = &mut self.process {
            process.reset_invalid();
        }
        if self.cpu.as_ref().is_some_and(|s| !s.is_valid()) {
            self.cpu = None;
        }
        if self.gpu.as_ref().is_some_and(|s| !s.is_valid()) {
            self.gpu = None;
        }
        if self.compositor.as_ref().is_some_and(|s| !s.is_valid()) {
            self.compositor = None;
        }
        if self.process.as_ref().is_some_and(|s| !s.is_valid()) {
            self.process = None;
        }
        if self.launcher.as_ref().is_some_and(|s| !s.is_valid()) {
            self.launcher = None;
        }
        if self.after_scripts.as_ref().is_some_and(|s| !s.is_valid()) {
            self.after_scripts = None;
        }
        if self.finish_scripts.as_ref().is_some_and(|s| !s.is_valid()) {
            self.finish_scripts = None;
        }
        if self.stop_after.as_ref().is_some_and(|s| !s.is_valid()) {
            self.stop_after = None;
        }
    }
}

fn parse_int(profile: &str, key: &str, value: &str) -> Option<i32> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("invalid {profile} property '{key}': it should be an integer");
            None
        }
    }
}

fn parse_float(profile: &str, key: &str, value: &str) -> Option<f64> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("invalid {profile} property '{key}': it should be a float");
            None
        }
    }
}

fn parse_flag(profile: &str, key: &str, value: Option<&str>) -> Option<bool> {
    match value {
        None => Some(true),
        Some(v) => {
            let parsed = conf::parse_bool(v);
            if parsed.is_none() {
                warn!("invalid {profile} property '{key}': it should be a boolean (0/1/false/true)");
            }
            parsed
        }
    }
}

/// Maps a line-oriented profile string. Unknown keys are ignored with a
/// warning; invalid values drop only the affected property.
pub fn map_profile(content: &str, path: Option<&Path>, add_settings: Option<&str>) -> OptimizationProfile {
    let mut profile = OptimizationProfile {
        cpu: Some(CpuSettings::default()),
        gpu: Some(GpuSettings::default()),
        compositor: Some(CompositorSettings::default()),
        process: Some(ProcessSettings {
            nice: Some(NiceSettings::default()),
            affinity: None,
            scheduling: Some(SchedulingSettings::default()),
            io: Some(IoSettings::default()),
        }),
        launcher: Some(LauncherSettings::default()),
        after_scripts: Some(ScriptSettings::default()),
        finish_scripts: Some(ScriptSettings::default()),
        stop_after: Some(StopSettings::default()),
        ..Default::default()
    };
    profile.set_path(path);

    let mut content = content.to_string();
    if let Some(add) = add_settings {
        content.push('\n');
        content.push_str(add);
        debug!("settings merged into {}: {add}", profile.log_str());
    }

    let tag = profile.log_str();
    for line in content.lines() {
        let Some((key, value)) = conf::split_line(line) else {
            continue;
        };
        apply_property(&mut profile, &tag, key, value);
    }

    profile.reset_invalid_sections();
    profile
}

fn apply_property(profile: &mut OptimizationProfile, tag: &str, key: &str, value: Option<&str>) {
    match key {
        "cpu.performance" => {
            if let Some(v) = parse_flag(tag, key, value) {
                profile.cpu.get_or_insert_with(Default::default).performance = Some(v);
            }
        }
        "gpu.performance" => {
            if let Some(v) = parse_flag(tag, key, value) {
                profile.gpu.get_or_insert_with(Default::default).performance = Some(v);
            }
        }
        "steam" => profile.steam = parse_flag(tag, key, value).or(profile.steam),
        "mouse.hidden" => profile.hide_mouse = parse_flag(tag, key, value).or(profile.hide_mouse),
        "compositor.off" => {
            if let Some(v) = parse_flag(tag, key, value) {
                profile.compositor.get_or_insert_with(Default::default).off = Some(v);
            }
        }
        "proc.nice" => {
            if let Some(v) = value.and_then(|v| parse_int(tag, key, v)) {
                process_nice(profile).level = Some(v);
            }
        }
        "proc.nice.delay" => {
            if let Some(v) = value.and_then(|v| parse_float(tag, key, v)) {
                process_nice(profile).delay = Some(v);
            }
        }
        "proc.nice.watch" => {
            if let Some(v) = parse_flag(tag, key, value) {
                process_nice(profile).watch = Some(v);
            }
        }
        "proc.affinity" => {
            if let Some(v) = value {
                let cpus = conf::parse_int_list(v);
                process_settings(profile).affinity = Some(cpus);
            }
        }
        "proc.policy" => match value.and_then(SchedPolicy::from_str) {
            Some(policy) => process_scheduling(profile).policy = Some(policy),
            None => warn!("invalid {tag} property '{key}': unknown value '{}'", value.unwrap_or("")),
        },
        "proc.policy.priority" => {
            if let Some(v) = value.and_then(|v| parse_int(tag, key, v)) {
                process_scheduling(profile).priority = Some(v);
            }
        }
        "proc.io.class" => match value.and_then(IoClass::from_str) {
            Some(class) => process_io(profile).class = Some(class),
            None => warn!("invalid {tag} property '{key}': unknown value '{}'", value.unwrap_or("")),
        },
        "proc.io.nice" => {
            if let Some(v) = value.and_then(|v| parse_int(tag, key, v)) {
                process_io(profile).nice = Some(v);
            }
        }
        "launcher" => {
            if let Some((source, target)) = value.and_then(conf::parse_map_entry) {
                if let Some(target) = target {
                    profile
                        .launcher
                        .get_or_insert_with(Default::default)
                        .mapping
                        .get_or_insert_with(HashMap::new)
                        .insert(source, target);
                } else {
                    warn!("invalid {tag} property '{key}': missing mapping target");
                }
            }
        }
        "launcher.skip_mapping" => {
            if let Some(v) = parse_flag(tag, key, value) {
                profile.launcher.get_or_insert_with(Default::default).skip_mapping = Some(v);
            }
        }
        "scripts.after" | "scripts.after.wait" | "scripts.after.timeout" | "scripts.after.root" => {
            let section = profile.after_scripts.get_or_insert_with(Default::default);
            apply_script_property(section, tag, key, value);
        }
        "scripts.finish" | "scripts.finish.wait" | "scripts.finish.timeout" | "scripts.finish.root" => {
            let section = profile.finish_scripts.get_or_insert_with(Default::default);
            apply_script_property(section, tag, key, value);
        }
        "stop.after" => {
            if let Some(v) = value {
                profile
                    .stop_after
                    .get_or_insert_with(Default::default)
                    .processes
                    .extend(conf::parse_str_set(v));
            }
        }
        "stop.after.relaunch" => {
            if let Some(v) = parse_flag(tag, key, value) {
                profile.stop_after.get_or_insert_with(Default::default).relaunch = Some(v);
            }
        }
        _ => warn!("unknown {tag} property '{key}' ignored"),
    }
}

fn apply_script_property(section: &mut ScriptSettings, tag: &str, key: &str, value: Option<&str>) {
    if key.ends_with(".wait") {
        if let Some(v) = parse_flag(tag, key, value) {
            section.wait_execution = v;
        }
    } else if key.ends_with(".timeout") {
        if let Some(v) = value.and_then(|v| parse_float(tag, key, v)) {
            section.timeout = Some(v);
        }
    } else if key.ends_with(".root") {
        if let Some(v) = parse_flag(tag, key, value) {
            section.run_as_root = v;
        }
    } else if let Some(v) = value {
        section.scripts.extend(conf::parse_str_list(v));
    }
}

fn process_settings(profile: &mut OptimizationProfile) -> &mut ProcessSettings {
    profile.process.get_or_insert_with(Default::default)
}

fn process_nice(profile: &mut OptimizationProfile) -> &mut NiceSettings {
    process_settings(profile).nice.get_or_insert_with(Default::default)
}

fn process_scheduling(profile: &mut OptimizationProfile) -> &mut SchedulingSettings {
    process_settings(profile)
        .scheduling
        .get_or_insert_with(Default::default)
}

fn process_io(profile: &mut OptimizationProfile) -> &mut IoSettings {
    process_settings(profile).io.get_or_insert_with(Default::default)
}

pub fn get_root_profile_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/etc/{APP_NAME}/{name}.profile"))
}

pub fn get_user_profile_path(name: &str, user_name: &str) -> PathBuf {
    PathBuf::from(format!("/home/{user_name}/.config/{APP_NAME}/{name}.profile"))
}

/// Profile lookup paths by priority: requesting user's config dir first for
/// non-root requests, then the system dir.
pub fn possible_profile_paths(
    name: &str,
    user_id: Option<u32>,
    user_name: Option<&str>,
) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if user_id.is_some_and(|id| id != 0) {
        if let Some(user) = user_name {
            paths.push(get_user_profile_path(name, user));
        }
    }
    paths.push(get_root_profile_path(name));
    paths
}

/// Reads and caches valid profiles. The cache key includes the extra settings
/// so distinct `profile_config` requests never share an entry.
pub struct ProfileReader {
    cache: Option<Mutex<HashMap<String, Arc<OptimizationProfile>>>>,
}

impl ProfileReader {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache: cache_enabled.then(|| Mutex::new(HashMap::new())),
        }
    }

    fn cache_key(path: &Path, add_settings: Option<&str>) -> String {
        match add_settings {
            Some(add) => format!("{}#{add}", path.display()),
            None => path.display().to_string(),
        }
    }

    /// `Err(NotFound)` lets the caller try the next candidate path; any other
    /// outcome is final for this path.
    pub async fn read_valid(
        &self,
        path: &Path,
        add_settings: Option<&str>,
    ) -> std::io::Result<Option<Arc<OptimizationProfile>>> {
        if let Some(cache) = &self.cache {
            if let Some(profile) = cache.lock().await.get(&Self::cache_key(path, add_settings)) {
                debug!("cached profile '{}' found", path.display());
                return Ok(Some(profile.clone()));
            }
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            warn!("no properties defined in profile file '{}'", path.display());
            return Ok(None);
        }

        let profile = map_profile(&content, Some(path), add_settings);
        if !profile.is_valid() {
            warn!("invalid profile file '{}'", path.display());
            return Ok(None);
        }

        let profile = Arc::new(profile);
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .await
                .insert(Self::cache_key(path, add_settings), profile.clone());
        }
        Ok(Some(profile))
    }

    pub async fn cached_count(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.lock().await.len(),
            None => 0,
        }
    }

    /// Warms the cache with every profile file found on disk.
    pub async fn pre_cache(&self) {
        let mut paths: HashSet<PathBuf> = HashSet::new();
        for pattern in [
            format!("/etc/{APP_NAME}/*.profile"),
            format!("/home/*/.config/{APP_NAME}/*.profile"),
        ] {
            if let Ok(entries) = glob::glob(&pattern) {
                paths.extend(entries.flatten());
            }
        }

        if paths.is_empty() {
            tracing::info!("no profile file found on disk to cache");
            return;
        }

        debug!("{} profile file(s) found on disk", paths.len());
        for path in paths {
            let _ = self.read_valid(&path, None).await;
        }
        tracing::info!("{} valid profile(s) cached", self.cached_count().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_profile_parses() {
        let profile = map_profile(
            "cpu.performance\n\
             gpu.performance=true\n\
             compositor.off\n\
             mouse.hidden\n\
             steam\n\
             proc.nice=-4\n\
             proc.nice.delay=0.5\n\
             proc.nice.watch\n\
             proc.affinity=0,1\n\
             proc.policy=rr\n\
             proc.policy.priority=42\n\
             proc.io.class=best_effort\n\
             proc.io.nice=3\n\
             launcher=launch-wrapper:c%/usr/bin/game\n\
             launcher.skip_mapping=false\n\
             scripts.after=/bin/notify,/bin/prepare\n\
             scripts.after.wait\n\
             scripts.finish=/bin/cleanup\n\
             scripts.finish.timeout=5\n\
             stop.after=picom,redshift\n\
             stop.after.relaunch",
            None,
            None,
        );

        assert_eq!(profile.cpu.as_ref().unwrap().performance, Some(true));
        assert_eq!(profile.gpu.as_ref().unwrap().performance, Some(true));
        assert_eq!(profile.compositor.as_ref().unwrap().off, Some(true));
        assert_eq!(profile.hide_mouse, Some(true));
        assert_eq!(profile.steam, Some(true));

        let process = profile.process.as_ref().unwrap();
        let nice = process.nice.as_ref().unwrap();
        assert_eq!(nice.level, Some(-4));
        assert_eq!(nice.delay, Some(0.5));
        assert_eq!(nice.watch, Some(true));
        assert_eq!(process.affinity.as_deref(), Some(&[0, 1][..]));
        let sched = process.scheduling.as_ref().unwrap();
        assert_eq!(sched.policy, Some(SchedPolicy::Rr));
        assert_eq!(sched.priority, Some(42));
        let io = process.io.as_ref().unwrap();
        assert_eq!(io.class, Some(IoClass::BestEffort));
        assert_eq!(io.nice, Some(3));

        let launcher = profile.launcher.as_ref().unwrap();
        assert_eq!(
            launcher.mapping.as_ref().unwrap().get("launch-wrapper").map(String::as_str),
            Some("c%/usr/bin/game")
        );
        assert_eq!(launcher.skip_mapping, Some(false));

        let after = profile.after_scripts.as_ref().unwrap();
        assert_eq!(after.scripts, vec!["/bin/notify", "/bin/prepare"]);
        assert!(after.wait_execution);
        let finish = profile.finish_scripts.as_ref().unwrap();
        assert_eq!(finish.scripts, vec!["/bin/cleanup"]);
        assert_eq!(finish.timeout, Some(5.0));

        let stop = profile.stop_after.as_ref().unwrap();
        assert!(stop.processes.contains("picom"));
        assert!(stop.processes.contains("redshift"));
        assert_eq!(stop.relaunch, Some(true));
        assert!(profile.is_valid());
    }

    #[test]
    fn empty_sections_are_dropped() {
        let profile = map_profile("cpu.performance", None, None);
        assert!(profile.cpu.is_some());
        assert!(profile.gpu.is_none());
        assert!(profile.process.is_none());
        assert!(profile.launcher.is_none());
        assert!(profile.after_scripts.is_none());
        assert!(profile.stop_after.is_none());
    }

    #[test]
    fn boundary_nice_levels() {
        for (level, valid) in [(-20, true), (19, true), (-21, false), (20, false)] {
            let profile = map_profile(&format!("proc.nice={level}"), None, None);
            let has_nice = profile
                .process
                .as_ref()
                .and_then(|p| p.nice.as_ref())
                .is_some();
            assert_eq!(has_nice, valid, "nice level {level}");
        }
    }

    #[test]
    fn affinity_bounds_checked_against_cpu_count() {
        let profile = map_profile("proc.affinity=0,1,2", None, None);
        let process = profile.process.as_ref().unwrap();
        assert!(process.has_valid_cpu_affinity(4));
        assert!(!process.has_valid_cpu_affinity(2));
        assert!(!process.has_valid_cpu_affinity(0));
    }

    #[test]
    fn scheduling_priority_validity() {
        let rr = SchedulingSettings {
            policy: Some(SchedPolicy::Rr),
            priority: Some(99),
        };
        assert!(rr.has_valid_priority());

        let out_of_range = SchedulingSettings {
            policy: Some(SchedPolicy::Fifo),
            priority: Some(100),
        };
        assert!(!out_of_range.has_valid_priority());

        let no_priority_policy = SchedulingSettings {
            policy: Some(SchedPolicy::Batch),
            priority: Some(10),
        };
        assert!(!no_priority_policy.has_valid_priority());
    }

    #[test]
    fn unknown_keys_do_not_invalidate() {
        let profile = map_profile("definitely.unknown=1\ncpu.performance", None, None);
        assert!(profile.is_valid());
        assert_eq!(profile.cpu.as_ref().unwrap().performance, Some(true));
    }

    #[test]
    fn extra_settings_override_base() {
        let profile = map_profile("proc.nice=5", None, Some("proc.nice=-10"));
        let nice = profile.process.as_ref().unwrap().nice.as_ref().unwrap();
        assert_eq!(nice.level, Some(-10));
    }

    #[test]
    fn profile_paths_by_priority() {
        let paths = possible_profile_paths("default", Some(1000), Some("player"));
        assert_eq!(paths[0], PathBuf::from("/home/player/.config/overdrive/default.profile"));
        assert_eq!(paths[1], PathBuf::from("/etc/overdrive/default.profile"));

        let root_paths = possible_profile_paths("default", Some(0), Some("root"));
        assert_eq!(root_paths, vec![PathBuf::from("/etc/overdrive/default.profile")]);
    }
}
