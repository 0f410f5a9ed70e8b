//! Launcher mapping: resolves the wrapper pid a request points at to the
//! process that should actually be optimized (Steam/Proton children,
//! user-declared launcher indirections). Sub-mappers run in fixed order; the
//! first hit wins.

use crate::config::APP_NAME;
use crate::profile::OptimizationProfile;
use crate::request::OptimizationRequest;
use crate::{steam, system};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TARGET_DELIMITER: char = '%';
const POLL_START: Duration = Duration::from_millis(1);
const POLL_CAP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Name,
    Command,
}

impl SearchMode {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.trim().to_lowercase().as_str() {
            "n" => Some(Self::Name),
            "c" => Some(Self::Command),
            _ => None,
        }
    }

    /// Absolute paths default to command search, anything else to name
    /// search.
    fn infer(target: &str) -> Self {
        if target.starts_with('/') {
            Self::Command
        } else {
            Self::Name
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Command => "command",
        }
    }
}

/// Splits a launchers target into its search word and mode (`n%foo`,
/// `c%/bin/foo`, bare word).
pub fn map_target(target: &str) -> (String, SearchMode) {
    match target.split_once(TARGET_DELIMITER) {
        Some((prefix, rest)) => match SearchMode::from_prefix(prefix) {
            Some(mode) => (rest.trim().to_string(), mode),
            None => {
                let mode = SearchMode::infer(target);
                warn!(
                    "invalid launcher target type '{prefix}' for mapping '{target}'. \
                     Default type '{}' will be considered",
                    mode.label()
                );
                (rest.trim().to_string(), mode)
            }
        },
        None => (target.to_string(), SearchMode::infer(target)),
    }
}

pub fn launchers_file_paths(user_id: Option<u32>, user_name: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if user_id.is_some_and(|id| id != 0) {
        if let Some(user) = user_name {
            paths.push(PathBuf::from(format!("/home/{user}/.config/{APP_NAME}/launchers")));
        }
    }
    paths.push(PathBuf::from(format!("/etc/{APP_NAME}/launchers")));
    paths
}

pub fn map_launchers(mapping: &HashMap<String, String>) -> HashMap<String, (String, SearchMode)> {
    mapping
        .iter()
        .filter(|(source, target)| !source.trim().is_empty() && !target.trim().is_empty())
        .map(|(source, target)| (source.trim().to_string(), map_target(target.trim())))
        .collect()
}

pub async fn read_launchers_file(
    path: &std::path::Path,
) -> std::io::Result<HashMap<String, (String, SearchMode)>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut launchers = HashMap::new();
    for line in content.lines() {
        if let Some((source, Some(target))) = crate::conf::split_line(line) {
            launchers.insert(source.to_string(), map_target(target));
        }
    }
    Ok(launchers)
}

struct Poll {
    deadline: Instant,
    backoff: Duration,
    started: Instant,
}

impl Poll {
    fn new(check_time: f64) -> Self {
        let now = Instant::now();
        Self {
            deadline: now + Duration::from_secs_f64(check_time.max(0.0)),
            backoff: POLL_START,
            started: now,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Exponential backoff, 1 ms doubling to a 50 ms cap.
    async fn wait(&mut self) {
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(POLL_CAP);
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

pub struct LauncherMapperManager {
    check_time: f64,
}

impl LauncherMapperManager {
    pub fn new(check_time: f64) -> Self {
        Self { check_time }
    }

    /// First non-nil sub-mapper result: explicit mapping, then Steam.
    pub async fn map_pid(
        &self,
        request: &OptimizationRequest,
        profile: &OptimizationProfile,
    ) -> Option<i32> {
        if let Some(pid) = self.map_explicit(request, profile).await {
            return Some(pid);
        }
        self.map_steam(request, profile).await
    }

    async fn find_wrapped_process(
        &self,
        target: &(String, SearchMode),
        launcher: &str,
    ) -> Option<i32> {
        let (word, mode) = target;
        let pattern = system::map_any_regex(word)?;
        debug!("looking for mapped process with {} '{word}' (launcher={launcher})", mode.label());

        let mut poll = Poll::new(self.check_time);
        loop {
            let found = match mode {
                SearchMode::Command => {
                    system::find_process_by_command(std::slice::from_ref(&pattern), true).await
                }
                SearchMode::Name => system::find_process_by_name(&pattern, true).await,
            };
            if let Some((pid, name)) = found {
                info!("mapped process '{name}' ({pid}) found in {:.2} seconds", poll.elapsed());
                return Some(pid);
            }
            if poll.expired() {
                break;
            }
            poll.wait().await;
        }
        warn!(
            "could not find process with {} '{word}' (launcher={launcher}). Timed out in {:.2} seconds",
            mode.label(),
            poll.elapsed()
        );
        None
    }

    async fn map_explicit(
        &self,
        request: &OptimizationRequest,
        profile: &OptimizationProfile,
    ) -> Option<i32> {
        let launcher_settings = profile.launcher.as_ref();

        if launcher_settings.and_then(|l| l.skip_mapping) == Some(true) {
            info!("skipping launcher mapping for {} (pid: {:?})", profile.log_str(), request.pid);
            return None;
        }

        let launchers = match launcher_settings.and_then(|l| l.mapping.as_ref()) {
            Some(mapping) => map_launchers(mapping),
            None => {
                let mut from_file = None;
                for path in launchers_file_paths(request.user_id, request.user_name.as_deref()) {
                    match read_launchers_file(&path).await {
                        Ok(launchers) => {
                            from_file = Some(launchers);
                            break;
                        }
                        Err(_) => {
                            debug!("launchers file '{}' not found (request: {:?})", path.display(), request.pid)
                        }
                    }
                }
                from_file.unwrap_or_default()
            }
        };

        if launchers.is_empty() {
            debug!("no valid launchers mapped found");
            return None;
        }

        let command = request.command.as_deref()?;
        let file_name = command.rsplit('/').next()?.trim();

        let mut target = launchers.get(file_name);
        if target.is_none() {
            // no exact match: try the glob-style keys
            for (source, mapped) in &launchers {
                if system::has_any_glob(source)
                    && system::map_any_regex(source).is_some_and(|re| re.is_match(file_name))
                {
                    target = Some(mapped);
                    break;
                }
            }
        }

        match target {
            Some(target) => self.find_wrapped_process(target, file_name).await,
            None => None,
        }
    }

    async fn map_steam(
        &self,
        request: &OptimizationRequest,
        profile: &OptimizationProfile,
    ) -> Option<i32> {
        if profile.steam != Some(true) {
            return None;
        }
        let command = request.command.as_deref()?;

        let Some(steam_cmd) = steam::get_steam_runtime_command(command) else {
            warn!("command not from Steam: {command} (pid: {:?})", request.pid);
            return None;
        };
        debug!("Steam command detected (pid: {:?}): {command}", request.pid);

        let proton = steam::get_proton_exec_name_and_paths(steam_cmd);
        let cmd_patterns: Vec<Regex> = match &proton {
            Some((_, windows_path, unix_path)) => [unix_path, windows_path]
                .iter()
                .filter_map(|p| Regex::new(&format!("^{}$", regex::escape(p))).ok())
                .collect(),
            None => {
                // native games may run behind a shell interpreter
                Regex::new(&format!(r"^(/bin/\w+\s+)?{}$", regex::escape(steam_cmd)))
                    .ok()
                    .into_iter()
                    .collect()
            }
        };

        let mut poll = Poll::new(self.check_time);
        loop {
            if let Some((pid, cmd)) = system::find_process_by_command(&cmd_patterns, true).await {
                info!("Steam process '{cmd}' ({pid}) found in {:.2} seconds", poll.elapsed());
                return Some(pid);
            }
            if poll.expired() {
                break;
            }
            poll.wait().await;
        }
        warn!(
            "could not find a Steam process matching command patterns (pid: {:?}). \
             Search timed out in {:.2} seconds",
            request.pid,
            poll.elapsed()
        );

        // last attempt: match by the executable name
        let proc_name = match &proton {
            Some((exe_name, _, _)) => exe_name.clone(),
            None => steam::get_exe_name(steam_cmd),
        };
        let Some(proc_name) = proc_name else {
            warn!(
                "name of launched Steam command could not be determined (request={:?}). \
                 No extra search will be performed",
                request.pid
            );
            return None;
        };

        debug!("trying to find Steam process by name '{proc_name}' (request: {:?})", request.pid);
        let pattern = Regex::new(&format!("^{}$", regex::escape(&proc_name))).ok()?;
        match system::find_process_by_name(&pattern, true).await {
            Some((pid, name)) => {
                info!("Steam process named '{name}' ({pid}) found");
                Some(pid)
            }
            None => {
                warn!("could not find a Steam process named {proc_name} (request={:?})", request.pid);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_prefixes_select_search_mode() {
        assert_eq!(map_target("n%game.exe"), ("game.exe".to_string(), SearchMode::Name));
        assert_eq!(map_target("c%/usr/bin/game"), ("/usr/bin/game".to_string(), SearchMode::Command));
    }

    #[test]
    fn absent_prefix_is_inferred_from_shape() {
        assert_eq!(map_target("/usr/bin/game"), ("/usr/bin/game".to_string(), SearchMode::Command));
        assert_eq!(map_target("game.exe"), ("game.exe".to_string(), SearchMode::Name));
    }

    #[test]
    fn unknown_prefix_falls_back_to_inference() {
        let (word, mode) = map_target("x%game.exe");
        assert_eq!(word, "game.exe");
        assert_eq!(mode, SearchMode::Name);
    }

    #[test]
    fn launchers_files_prefer_the_user_dir() {
        let paths = launchers_file_paths(Some(1000), Some("player"));
        assert_eq!(paths[0], PathBuf::from("/home/player/.config/overdrive/launchers"));
        assert_eq!(paths[1], PathBuf::from("/etc/overdrive/launchers"));

        let root = launchers_file_paths(Some(0), Some("root"));
        assert_eq!(root, vec![PathBuf::from("/etc/overdrive/launchers")]);
    }

    #[tokio::test]
    async fn launchers_file_parses_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("launchers");
        std::fs::write(&path, "# wrappers\nLauncher.sh=n%Game.exe\nwrap*=c%/opt/game/bin # glob\n").unwrap();

        let launchers = read_launchers_file(&path).await.unwrap();
        assert_eq!(
            launchers.get("Launcher.sh"),
            Some(&("Game.exe".to_string(), SearchMode::Name))
        );
        assert_eq!(
            launchers.get("wrap*"),
            Some(&("/opt/game/bin".to_string(), SearchMode::Command))
        );
    }

    #[tokio::test]
    async fn skip_mapping_short_circuits_even_with_mapping_present() {
        let manager = LauncherMapperManager::new(0.01);
        let request = OptimizationRequest {
            pid: Some(1),
            command: Some("/usr/bin/wrapper".to_string()),
            user_name: Some("u".to_string()),
            user_id: Some(1000),
            ..Default::default()
        };
        let profile = crate::profile::map_profile(
            "launcher=wrapper:n%something-not-running\nlauncher.skip_mapping",
            None,
            None,
        );
        assert_eq!(manager.map_explicit(&request, &profile).await, None);
    }

    #[tokio::test]
    async fn steam_mapper_requires_steam_profile() {
        let manager = LauncherMapperManager::new(0.01);
        let request = OptimizationRequest {
            pid: Some(1),
            command: Some("/usr/bin/game".to_string()),
            ..Default::default()
        };
        let profile = crate::profile::map_profile("cpu.performance", None, None);
        assert_eq!(manager.map_steam(&request, &profile).await, None);
    }
}
