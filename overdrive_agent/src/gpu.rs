//! GPU power-mode control. Two driver variants: NVIDIA (driven through the
//! vendor CLI tools) and AMD (driven through sysfs). The manager owns the
//! daemon-wide prior-state cache; each driver serializes its own mutations.

use crate::system;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

impl GpuVendor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nvidia => "Nvidia",
            Self::Amd => "AMD",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "nvidia" => Some(Self::Nvidia),
            "amd" => Some(Self::Amd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NvidiaPowerMode {
    OnDemand,
    Performance,
    Auto,
}

impl NvidiaPowerMode {
    pub fn value(&self) -> u8 {
        match self {
            Self::OnDemand => 0,
            Self::Performance => 1,
            Self::Auto => 2,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::OnDemand),
            1 => Some(Self::Performance),
            2 => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Vendor-specific power mode. AMD encodes the
/// `performance_level:power_profile` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PowerMode {
    Nvidia(NvidiaPowerMode),
    Amd(String),
}

impl std::fmt::Display for PowerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nvidia(mode) => write!(f, "{}", mode.value()),
            Self::Amd(mode) => write!(f, "{mode}"),
        }
    }
}

/// A GPU's prior mode, remembered for restoration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpuState {
    pub id: String,
    pub vendor: GpuVendor,
    pub power_mode: PowerMode,
}

static RE_NVIDIA_SET_POWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[gpu:(\d+)\].+?(\d)\.?").expect("nvidia set regex"));
static RE_NVIDIA_GET_POWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Attribute\s+.+\[gpu:(\d+)\].+:\s+(\d)").expect("nvidia get regex"));
static RE_AMD_ACTIVE_PROFILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+\*:?$").expect("amd profile regex"));

#[derive(Debug, Default)]
pub struct NvidiaDriver;

impl NvidiaDriver {
    fn with_lang(user_env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env = user_env.cloned().unwrap_or_default();
        env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        env
    }

    fn can_work(&self) -> (bool, Option<String>) {
        for tool in ["nvidia-settings", "nvidia-smi"] {
            if which::which(tool).is_err() {
                return (false, Some(format!("'{tool}' is not installed")));
            }
        }
        (true, None)
    }

    async fn get_gpus(&self) -> BTreeSet<String> {
        let (code, output) = system::run_shell("nvidia-smi --query-gpu=index --format=csv,noheader", None).await;
        let mut gpus = BTreeSet::new();
        if code == 0 {
            if let Some(output) = output {
                gpus.extend(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
            }
        }
        gpus
    }

    async fn get_power_mode(
        &self,
        gpu_ids: &BTreeSet<String>,
        user_env: Option<&HashMap<String, String>>,
    ) -> Option<HashMap<String, PowerMode>> {
        if gpu_ids.is_empty() {
            return None;
        }
        let query: Vec<String> = gpu_ids.iter().map(|id| format!("-q [gpu:{id}]/GpuPowerMizerMode")).collect();
        let cmd = format!("nvidia-settings {}", query.join(" "));
        let (code, output) = system::run_shell(&cmd, Some(&Self::with_lang(user_env))).await;

        if code != 0 {
            error!("Nvidia: could not detect GPUs power mode ({cmd})");
            return None;
        }
        let output = output?;
        let mut modes = HashMap::new();
        for caps in RE_NVIDIA_GET_POWER.captures_iter(&output) {
            let id = caps.get(1)?.as_str();
            if !gpu_ids.contains(id) {
                continue;
            }
            let raw: u8 = caps.get(2)?.as_str().parse().ok()?;
            modes.insert(id.to_string(), PowerMode::Nvidia(NvidiaPowerMode::from_value(raw)?));
        }
        if modes.is_empty() {
            error!("Nvidia: could not detect GPUs power mode ({cmd}). No modes found in output");
            None
        } else {
            Some(modes)
        }
    }

    async fn set_power_mode(
        &self,
        ids_modes: &HashMap<String, PowerMode>,
        user_env: Option<&HashMap<String, String>>,
    ) -> HashMap<String, bool> {
        let params: Vec<String> = ids_modes
            .iter()
            .map(|(id, mode)| format!("-a [gpu:{id}]/GpuPowerMizerMode={mode}"))
            .collect();
        let cmd = format!("nvidia-settings {}", params.join(" "));
        info!("Nvidia: changing GPUs power mode: {cmd}");
        let (_, output) = system::run_shell(&cmd, Some(&Self::with_lang(user_env))).await;

        if let Some(output) = output {
            let changed: HashMap<&str, &str> = RE_NVIDIA_SET_POWER
                .captures_iter(&output)
                .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
                .collect();
            if !changed.is_empty() {
                return ids_modes
                    .iter()
                    .map(|(id, mode)| {
                        let ok = changed
                            .get(id.as_str())
                            .and_then(|raw| raw.parse::<u8>().ok())
                            .is_some_and(|raw| PowerMode::Nvidia(NvidiaPowerMode::from_value(raw).unwrap_or(NvidiaPowerMode::Auto)) == *mode);
                        (id.clone(), ok)
                    })
                    .collect();
            }
        }
        error!("Nvidia: could not determine the changing modes response");
        ids_modes.keys().map(|id| (id.clone(), false)).collect()
    }
}

pub const AMD_PERFORMANCE_FILE: &str = "power_dpm_force_performance_level";
pub const AMD_PROFILE_FILE: &str = "pp_power_profile_mode";
pub const AMD_GPUS_PATH: &str = "/sys/class/drm/card{id}/device";

#[derive(Debug)]
pub struct AmdDriver {
    gpus_path: String,
    re_extract_id: Regex,
}

impl AmdDriver {
    pub fn new(gpus_path: &str) -> Self {
        let re = regex::escape(gpus_path).replace(r"\{id\}", r"(\d+)");
        Self {
            gpus_path: gpus_path.to_string(),
            re_extract_id: Regex::new(&re).expect("amd id regex"),
        }
    }

    fn gpu_dir(&self, id: &str) -> String {
        self.gpus_path.replace("{id}", id)
    }

    fn extract_gpu_id(&self, gpu_path: &str) -> Option<String> {
        match self.re_extract_id.captures(gpu_path).and_then(|c| c.get(1)) {
            Some(id) => Some(id.as_str().to_string()),
            None => {
                error!("AMD: could not extract GPU id from path: {gpu_path}");
                None
            }
        }
    }

    fn is_writable(path: &Path) -> bool {
        nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
    }

    async fn get_gpus(&self) -> BTreeSet<String> {
        let mut per_file: HashMap<&str, HashSet<String>> = HashMap::new();
        per_file.insert(AMD_PERFORMANCE_FILE, HashSet::new());
        per_file.insert(AMD_PROFILE_FILE, HashSet::new());

        let pattern = format!("{}/*", self.gpu_dir("*"));
        if let Ok(entries) = glob::glob(&pattern) {
            for path in entries.flatten() {
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(dirs) = per_file.get_mut(file_name) else {
                    continue;
                };
                if !Self::is_writable(&path) {
                    warn!(
                        "AMD: writing is not allowed for file '{}'. It will not be possible to set the GPU to performance mode",
                        path.display()
                    );
                    continue;
                }
                if let Some(dir) = path.parent().map(|p| p.to_string_lossy().into_owned()) {
                    dirs.insert(dir);
                }
            }
        }

        let all_dirs: HashSet<&String> = per_file.values().flatten().collect();
        let mut gpus = BTreeSet::new();
        for dir in all_dirs {
            let missing: Vec<&str> = per_file
                .iter()
                .filter(|(_, dirs)| !dirs.contains(dir.as_str()))
                .map(|(file, _)| *file)
                .collect();
            if !missing.is_empty() {
                warn!(
                    "AMD: not all required files are accessible for GPU mounted in '{dir}' (missing: {})",
                    missing.join(", ")
                );
            } else if let Some(id) = self.extract_gpu_id(dir) {
                gpus.insert(id);
            }
        }
        gpus
    }

    fn map_power_profile_output(output: &str, file_path: &str) -> Option<String> {
        for raw_line in output.lines() {
            if !raw_line.starts_with(' ') {
                continue;
            }
            let tokens: Vec<&str> = raw_line.split_whitespace().collect();
            if tokens.len() > 1
                && tokens[0].chars().all(|c| c.is_ascii_digit())
                && RE_AMD_ACTIVE_PROFILE.is_match(tokens[tokens.len() - 1])
            {
                return Some(tokens[0].to_string());
            }
        }
        warn!("AMD: could not map power profile from {file_path}");
        None
    }

    async fn read_file(path: &str) -> Option<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Some(content),
            Err(e) => {
                error!("AMD: could not read file '{path}': {e}");
                None
            }
        }
    }

    async fn get_power_mode(&self, gpu_ids: &BTreeSet<String>) -> Option<HashMap<String, PowerMode>> {
        if gpu_ids.is_empty() {
            return None;
        }
        let mut modes = HashMap::new();
        for id in gpu_ids {
            let gpu_dir = self.gpu_dir(id);
            let level_file = format!("{gpu_dir}/{AMD_PERFORMANCE_FILE}");
            let Some(level) = Self::read_file(&level_file).await.map(|s| s.trim().to_string()) else {
                continue;
            };
            if level.is_empty() {
                continue;
            }

            let profile_file = format!("{gpu_dir}/{AMD_PROFILE_FILE}");
            let Some(profile_raw) = Self::read_file(&profile_file).await else {
                continue;
            };
            let Some(profile) = Self::map_power_profile_output(&profile_raw, &profile_file) else {
                continue;
            };
            modes.insert(id.clone(), PowerMode::Amd(format!("{level}:{profile}")));
        }
        if modes.is_empty() {
            None
        } else {
            Some(modes)
        }
    }

    async fn write_file(path: &str, content: &str) -> bool {
        match tokio::fs::write(path, content).await {
            Ok(()) => true,
            Err(e) => {
                error!("AMD: could not write '{content}' to file '{path}': {e}");
                false
            }
        }
    }

    async fn set_power_mode(&self, ids_modes: &HashMap<String, PowerMode>) -> HashMap<String, bool> {
        let mut res = HashMap::new();
        for (id, mode) in ids_modes {
            let mode_str = mode.to_string();
            let Some((level, profile)) = mode_str.split_once(':') else {
                error!(
                    "AMD: could not change GPU ({id}) operation mode: unexpected mode format '{mode_str}' \
                     (expected: 'performance_level:power_profile')"
                );
                res.insert(id.clone(), false);
                continue;
            };
            let gpu_dir = self.gpu_dir(id);
            info!("AMD: changing GPU ({id}) operation mode (performance: {level}, profile: {profile})");
            let level_ok = Self::write_file(&format!("{gpu_dir}/{AMD_PERFORMANCE_FILE}"), level).await;
            let profile_ok = Self::write_file(&format!("{gpu_dir}/{AMD_PROFILE_FILE}"), profile).await;
            res.insert(id.clone(), level_ok && profile_ok);
        }
        res
    }
}

#[derive(Debug)]
enum DriverKind {
    Nvidia(NvidiaDriver),
    Amd(AmdDriver),
}

/// One vendor driver plus its private operation lock and GPU-listing cache.
#[derive(Debug)]
pub struct GpuDriver {
    kind: DriverKind,
    cache_enabled: bool,
    cached_gpus: Mutex<Option<BTreeSet<String>>>,
    op: Mutex<()>,
    warned_unavailable: AtomicBool,
}

impl GpuDriver {
    pub fn nvidia(cache_enabled: bool) -> Self {
        Self::with_kind(DriverKind::Nvidia(NvidiaDriver), cache_enabled)
    }

    pub fn amd(cache_enabled: bool) -> Self {
        Self::amd_at(AMD_GPUS_PATH, cache_enabled)
    }

    pub fn amd_at(gpus_path: &str, cache_enabled: bool) -> Self {
        Self::with_kind(DriverKind::Amd(AmdDriver::new(gpus_path)), cache_enabled)
    }

    fn with_kind(kind: DriverKind, cache_enabled: bool) -> Self {
        Self {
            kind,
            cache_enabled,
            cached_gpus: Mutex::new(None),
            op: Mutex::new(()),
            warned_unavailable: AtomicBool::new(false),
        }
    }

    pub fn vendor(&self) -> GpuVendor {
        match &self.kind {
            DriverKind::Nvidia(_) => GpuVendor::Nvidia,
            DriverKind::Amd(_) => GpuVendor::Amd,
        }
    }

    pub fn can_work(&self) -> (bool, Option<String>) {
        match &self.kind {
            DriverKind::Nvidia(driver) => driver.can_work(),
            DriverKind::Amd(_) => (true, None),
        }
    }

    fn warn_unavailable_once(&self, reason: Option<String>) {
        if !self.warned_unavailable.swap(true, Ordering::Relaxed) {
            warn!(
                "{} GPUs cannot be managed: {}",
                self.vendor().name(),
                reason.unwrap_or_else(|| "unknown reason".to_string())
            );
        }
    }

    /// Serializes this driver's read-cache-write sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.op.lock().await
    }

    pub async fn get_gpus(&self) -> BTreeSet<String> {
        match &self.kind {
            DriverKind::Nvidia(driver) => driver.get_gpus().await,
            DriverKind::Amd(driver) => driver.get_gpus().await,
        }
    }

    /// GPU ids, probed once when caching is enabled.
    pub async fn cached_gpus(&self) -> BTreeSet<String> {
        if !self.cache_enabled {
            return self.get_gpus().await;
        }
        let mut cache = self.cached_gpus.lock().await;
        if cache.is_none() {
            *cache = Some(self.get_gpus().await);
        }
        cache.clone().unwrap_or_default()
    }

    pub async fn get_power_mode(
        &self,
        gpu_ids: &BTreeSet<String>,
        user_env: Option<&HashMap<String, String>>,
    ) -> Option<HashMap<String, PowerMode>> {
        match &self.kind {
            DriverKind::Nvidia(driver) => driver.get_power_mode(gpu_ids, user_env).await,
            DriverKind::Amd(driver) => driver.get_power_mode(gpu_ids).await,
        }
    }

    pub async fn set_power_mode(
        &self,
        ids_modes: &HashMap<String, PowerMode>,
        user_env: Option<&HashMap<String, String>>,
    ) -> HashMap<String, bool> {
        match &self.kind {
            DriverKind::Nvidia(driver) => driver.set_power_mode(ids_modes, user_env).await,
            DriverKind::Amd(driver) => driver.set_power_mode(ids_modes).await,
        }
    }

    pub fn default_mode(&self) -> PowerMode {
        match &self.kind {
            DriverKind::Nvidia(_) => PowerMode::Nvidia(NvidiaPowerMode::Auto),
            DriverKind::Amd(_) => PowerMode::Amd("auto:3".to_string()),
        }
    }

    pub fn performance_mode(&self) -> PowerMode {
        match &self.kind {
            DriverKind::Nvidia(_) => PowerMode::Nvidia(NvidiaPowerMode::Performance),
            DriverKind::Amd(_) => PowerMode::Amd("manual:5".to_string()),
        }
    }
}

pub struct GpuManager {
    drivers: Vec<GpuDriver>,
    cache_gpus: bool,
    state_cache: Mutex<HashMap<GpuVendor, HashMap<String, PowerMode>>>,
    working_cache: Mutex<Option<Vec<usize>>>,
}

impl GpuManager {
    pub fn new(cache_gpus: bool, vendor: Option<GpuVendor>) -> Self {
        let drivers = match vendor {
            Some(GpuVendor::Nvidia) => vec![GpuDriver::nvidia(cache_gpus)],
            Some(GpuVendor::Amd) => vec![GpuDriver::amd(cache_gpus)],
            None => vec![GpuDriver::nvidia(cache_gpus), GpuDriver::amd(cache_gpus)],
        };
        Self::with_drivers(drivers, cache_gpus)
    }

    pub fn with_drivers(drivers: Vec<GpuDriver>, cache_gpus: bool) -> Self {
        Self {
            drivers,
            cache_gpus,
            state_cache: Mutex::new(HashMap::new()),
            working_cache: Mutex::new(None),
        }
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_gpus
    }

    pub fn drivers(&self) -> &[GpuDriver] {
        &self.drivers
    }

    pub fn driver_for(&self, vendor: GpuVendor) -> Option<&GpuDriver> {
        self.drivers.iter().find(|d| d.vendor() == vendor)
    }

    async fn probe_driver(&self, idx: usize) -> Option<(usize, BTreeSet<String>)> {
        let driver = &self.drivers[idx];
        let (can_work, reason) = driver.can_work();
        if !can_work {
            driver.warn_unavailable_once(reason);
            return None;
        }
        let gpus = driver.cached_gpus().await;
        if gpus.is_empty() {
            debug!("[{}] no GPUs available", driver.vendor().name());
            return None;
        }
        debug!("[{}] GPUs available: {}", driver.vendor().name(), gpus.len());
        Some((idx, gpus))
    }

    /// Working drivers and their GPU sets. Frozen after the first call when
    /// `cache_gpus` is on, probed every time otherwise.
    pub async fn map_working_drivers_and_gpus(&self) -> Vec<(&GpuDriver, BTreeSet<String>)> {
        if self.cache_gpus {
            let mut working = self.working_cache.lock().await;
            if let Some(idxs) = working.as_ref() {
                let mut result = Vec::with_capacity(idxs.len());
                for idx in idxs {
                    result.push((&self.drivers[*idx], self.drivers[*idx].cached_gpus().await));
                }
                return result;
            }
            let mut result = Vec::new();
            let mut idxs = Vec::new();
            for idx in 0..self.drivers.len() {
                if let Some((idx, gpus)) = self.probe_driver(idx).await {
                    idxs.push(idx);
                    result.push((&self.drivers[idx], gpus));
                }
            }
            *working = Some(idxs);
            result
        } else {
            let mut result = Vec::new();
            for idx in 0..self.drivers.len() {
                if let Some((idx, gpus)) = self.probe_driver(idx).await {
                    result.push((&self.drivers[idx], gpus));
                }
            }
            result
        }
    }

    /// Switches the target GPUs into performance mode and returns the prior
    /// states the caller must remember for restoration. GPUs already at
    /// performance reuse the cached prior mode, if any.
    pub async fn activate_performance(
        &self,
        user_env: Option<&HashMap<String, String>>,
        target_gpu_ids: Option<&BTreeSet<String>>,
    ) -> HashMap<GpuVendor, HashSet<GpuState>> {
        let mut res: HashMap<GpuVendor, HashSet<GpuState>> = HashMap::new();

        for (driver, gpus) in self.map_working_drivers_and_gpus().await {
            let targets: BTreeSet<String> = match target_gpu_ids {
                Some(ids) => gpus.intersection(ids).cloned().collect(),
                None => gpus.clone(),
            };
            if targets.is_empty() {
                debug!(
                    "[{}] no valid target GPUs available for performance mode",
                    driver.vendor().name()
                );
                continue;
            }

            let _guard = driver.lock().await;
            let Some(gpu_modes) = driver.get_power_mode(&targets, user_env).await else {
                continue;
            };

            let performance = driver.performance_mode();
            let mut driver_res = HashSet::new();
            let mut not_in_performance = BTreeSet::new();
            {
                let mut cache = self.state_cache.lock().await;
                let cached = cache.entry(driver.vendor()).or_default();
                for (gpu, mode) in gpu_modes {
                    if mode != performance {
                        cached.entry(gpu.clone()).or_insert_with(|| mode.clone());
                        driver_res.insert(GpuState {
                            id: gpu.clone(),
                            vendor: driver.vendor(),
                            power_mode: mode,
                        });
                        not_in_performance.insert(gpu);
                    } else if let Some(old_mode) = cached.get(&gpu) {
                        driver_res.insert(GpuState {
                            id: gpu.clone(),
                            vendor: driver.vendor(),
                            power_mode: old_mode.clone(),
                        });
                    }
                }
            }

            if !not_in_performance.is_empty() {
                let wanted: HashMap<String, PowerMode> = not_in_performance
                    .iter()
                    .map(|g| (g.clone(), performance.clone()))
                    .collect();
                let changed = driver.set_power_mode(&wanted, user_env).await;
                let not_changed: Vec<&String> =
                    changed.iter().filter(|(_, ok)| !**ok).map(|(gpu, _)| gpu).collect();
                if !not_changed.is_empty() {
                    error!(
                        "[{}] could not change power mode of GPUs: {:?}",
                        driver.vendor().name(),
                        not_changed
                    );
                }
            }

            if !driver_res.is_empty() {
                res.insert(driver.vendor(), driver_res);
            }
        }

        res
    }

    pub async fn state_cache_view(&self) -> HashMap<GpuVendor, HashMap<String, PowerMode>> {
        self.state_cache.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROFILE_TABLE: &str = "NUM        MODE_NAME     SCLK_UP_HYST\n  0   BOOTUP_DEFAULT:\n  3          VIDEO*:\n  5          COMPUTE:\n";

    fn fake_amd_card(dir: &TempDir, id: u32, level: &str, profile_table: &str) {
        let device = dir.path().join(format!("card{id}/device"));
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join(AMD_PERFORMANCE_FILE), level).unwrap();
        std::fs::write(device.join(AMD_PROFILE_FILE), profile_table).unwrap();
    }

    fn amd_pattern(dir: &TempDir) -> String {
        dir.path().join("card{id}/device").to_string_lossy().into_owned()
    }

    #[test]
    fn active_amd_profile_is_the_starred_row() {
        assert_eq!(
            AmdDriver::map_power_profile_output(PROFILE_TABLE, "x").as_deref(),
            Some("3")
        );
        assert_eq!(AmdDriver::map_power_profile_output("no rows here", "x"), None);
    }

    #[tokio::test]
    async fn amd_enumerates_cards_with_both_files() {
        let dir = TempDir::new().unwrap();
        fake_amd_card(&dir, 0, "auto", PROFILE_TABLE);
        fake_amd_card(&dir, 1, "auto", PROFILE_TABLE);
        // card2 misses the profile file
        let partial = dir.path().join("card2/device");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join(AMD_PERFORMANCE_FILE), "auto").unwrap();

        let driver = GpuDriver::amd_at(&amd_pattern(&dir), false);
        let gpus = driver.get_gpus().await;
        assert_eq!(gpus, BTreeSet::from(["0".to_string(), "1".to_string()]));
    }

    #[tokio::test]
    async fn amd_power_mode_round_trip() {
        let dir = TempDir::new().unwrap();
        fake_amd_card(&dir, 0, "auto", PROFILE_TABLE);
        let driver = GpuDriver::amd_at(&amd_pattern(&dir), false);

        let gpus = BTreeSet::from(["0".to_string()]);
        let modes = driver.get_power_mode(&gpus, None).await.unwrap();
        assert_eq!(modes.get("0"), Some(&PowerMode::Amd("auto:3".to_string())));

        let wanted = HashMap::from([("0".to_string(), driver.performance_mode())]);
        let changed = driver.set_power_mode(&wanted, None).await;
        assert_eq!(changed.get("0"), Some(&true));

        let device = dir.path().join("card0/device");
        assert_eq!(std::fs::read_to_string(device.join(AMD_PERFORMANCE_FILE)).unwrap(), "manual");
        assert_eq!(std::fs::read_to_string(device.join(AMD_PROFILE_FILE)).unwrap(), "5");
    }

    #[tokio::test]
    async fn activate_performance_records_prior_state_once() {
        let dir = TempDir::new().unwrap();
        fake_amd_card(&dir, 0, "auto", PROFILE_TABLE);
        let manager =
            GpuManager::with_drivers(vec![GpuDriver::amd_at(&amd_pattern(&dir), false)], false);

        let previous = manager.activate_performance(None, None).await;
        let states = previous.get(&GpuVendor::Amd).unwrap();
        assert_eq!(states.len(), 1);
        let state = states.iter().next().unwrap();
        assert_eq!(state.id, "0");
        assert_eq!(state.power_mode, PowerMode::Amd("auto:3".to_string()));

        // second activation: GPU already in performance, prior mode comes
        // from the cache and the cache entry is not overwritten
        std::fs::write(
            dir.path().join("card0/device").join(AMD_PROFILE_FILE),
            PROFILE_TABLE.replace("VIDEO*", "VIDEO").replace("COMPUTE", "COMPUTE*"),
        )
        .unwrap();
        let again = manager.activate_performance(None, None).await;
        let states = again.get(&GpuVendor::Amd).unwrap();
        let state = states.iter().next().unwrap();
        assert_eq!(state.power_mode, PowerMode::Amd("auto:3".to_string()));

        let cache = manager.state_cache_view().await;
        assert_eq!(
            cache.get(&GpuVendor::Amd).unwrap().get("0"),
            Some(&PowerMode::Amd("auto:3".to_string()))
        );
    }

    #[tokio::test]
    async fn target_filter_excludes_other_gpus() {
        let dir = TempDir::new().unwrap();
        fake_amd_card(&dir, 0, "auto", PROFILE_TABLE);
        fake_amd_card(&dir, 1, "auto", PROFILE_TABLE);
        let manager =
            GpuManager::with_drivers(vec![GpuDriver::amd_at(&amd_pattern(&dir), false)], false);

        let targets = BTreeSet::from(["1".to_string()]);
        let previous = manager.activate_performance(None, Some(&targets)).await;
        let states = previous.get(&GpuVendor::Amd).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states.iter().next().unwrap().id, "1");
    }
}
