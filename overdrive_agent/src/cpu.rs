//! CPU scaling-governor and energy-policy managers. Each guards its saved
//! prior state with a private lock; callers hold the guard across the whole
//! read-change-save critical section. Saved state is monotonic per CPU: the
//! first observed value wins until restored.

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const GOVERNOR_PERFORMANCE: &str = "performance";
pub const GOVERNOR_FILE_PATTERN: &str = "/sys/devices/system/cpu/cpu{}/cpufreq/scaling_governor";
pub const ENERGY_FILE_PATTERN: &str = "/sys/devices/system/cpu/cpu{}/power/energy_perf_bias";

/// Governor name to the CPUs it applies to.
pub type GovernorMap = HashMap<String, BTreeSet<usize>>;

pub fn get_cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0)
}

fn fill_path(pattern: &str, idx: usize) -> String {
    pattern.replace("{}", &idx.to_string())
}

fn cpus_to_str(cpus: &BTreeSet<usize>) -> String {
    cpus.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Default)]
pub struct SavedGovernors {
    by_cpu: HashMap<usize, String>,
}

impl SavedGovernors {
    /// Never overwrites an already-saved CPU.
    pub fn save(&mut self, governors: &GovernorMap) {
        for (gov, cpus) in governors {
            for cpu in cpus {
                self.by_cpu.entry(*cpu).or_insert_with(|| gov.clone());
            }
        }
    }

    pub fn as_governor_map(&self) -> Option<GovernorMap> {
        if self.by_cpu.is_empty() {
            return None;
        }
        let mut map = GovernorMap::new();
        for (cpu, gov) in &self.by_cpu {
            map.entry(gov.clone()).or_default().insert(*cpu);
        }
        Some(map)
    }

    pub fn get(&self, cpu: usize) -> Option<&str> {
        self.by_cpu.get(&cpu).map(String::as_str)
    }
}

pub struct CpuFrequencyManager {
    cpu_count: usize,
    file_pattern: String,
    saved: Mutex<SavedGovernors>,
}

impl CpuFrequencyManager {
    pub fn new(cpu_count: usize) -> Self {
        Self::with_file_pattern(cpu_count, GOVERNOR_FILE_PATTERN)
    }

    pub fn with_file_pattern(cpu_count: usize, file_pattern: &str) -> Self {
        Self {
            cpu_count,
            file_pattern: file_pattern.to_string(),
            saved: Mutex::new(SavedGovernors::default()),
        }
    }

    pub fn cpu0_governor_file(&self) -> String {
        fill_path(&self.file_pattern, 0)
    }

    /// Guards the whole governor-switching critical section and the saved
    /// prior state.
    pub async fn lock(&self) -> MutexGuard<'_, SavedGovernors> {
        self.saved.lock().await
    }

    pub async fn map_current_governors(&self) -> GovernorMap {
        let mut governors = GovernorMap::new();
        for cpu in 0..self.cpu_count {
            let path = fill_path(&self.file_pattern, cpu);
            match tokio::fs::read_to_string(&path).await {
                Ok(gov) => {
                    governors.entry(gov.trim().to_string()).or_default().insert(cpu);
                }
                Err(_) => {
                    warn!("could not read governor for CPU '{cpu}'. File '{path}' not found");
                }
            }
        }
        governors
    }

    async fn write_governor(&self, idx: usize, governor: &str) -> bool {
        tokio::fs::write(fill_path(&self.file_pattern, idx), governor).await.is_ok()
    }

    /// Returns the CPUs actually changed; write failures are reported and the
    /// CPU is left out.
    pub async fn change_governor(&self, governor: &str, cpu_idxs: Option<&BTreeSet<usize>>) -> BTreeSet<usize> {
        if self.cpu_count == 0 {
            return BTreeSet::new();
        }

        let targets: BTreeSet<usize> = match cpu_idxs {
            Some(idxs) => idxs.clone(),
            None => (0..self.cpu_count).collect(),
        };
        let results = join_all(targets.iter().map(|idx| self.write_governor(*idx, governor))).await;

        let mut changed = BTreeSet::new();
        let mut not_changed = BTreeSet::new();
        for (idx, ok) in targets.iter().zip(results) {
            if ok {
                changed.insert(*idx);
            } else {
                not_changed.insert(*idx);
            }
        }

        if !not_changed.is_empty() {
            warn!(
                "could not change CPUs [{}] frequency governor to '{governor}'",
                cpus_to_str(&not_changed)
            );
        }
        if !changed.is_empty() {
            info!("CPUs [{}] frequency governor changed to '{governor}'", cpus_to_str(&changed));
        }
        changed
    }
}

pub const LEVEL_PERFORMANCE: i32 = 0;

#[derive(Debug, Default)]
pub struct SavedEnergyLevels {
    by_cpu: HashMap<usize, i32>,
}

impl SavedEnergyLevels {
    /// Monotonic per CPU, like the governor cache.
    pub fn save(&mut self, states: &HashMap<usize, i32>) {
        for (idx, state) in states {
            self.by_cpu.entry(*idx).or_insert(*state);
        }
    }

    pub fn view(&self) -> HashMap<usize, i32> {
        self.by_cpu.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cpu.is_empty()
    }

    /// Clears the given CPUs, or everything when none are given.
    pub fn clear(&mut self, cpus: &[usize]) {
        if cpus.is_empty() {
            self.by_cpu.clear();
        } else {
            for cpu in cpus {
                self.by_cpu.remove(cpu);
            }
        }
    }
}

pub struct CpuEnergyPolicyManager {
    cpu_count: usize,
    file_pattern: String,
    saved: Mutex<SavedEnergyLevels>,
}

impl CpuEnergyPolicyManager {
    pub fn new(cpu_count: usize) -> Self {
        Self::with_file_pattern(cpu_count, ENERGY_FILE_PATTERN)
    }

    pub fn with_file_pattern(cpu_count: usize, file_pattern: &str) -> Self {
        Self {
            cpu_count,
            file_pattern: file_pattern.to_string(),
            saved: Mutex::new(SavedEnergyLevels::default()),
        }
    }

    pub fn can_work(&self) -> (bool, Option<String>) {
        if self.cpu_count == 0 {
            return (
                false,
                Some("it will not be possible to change the CPU energy policy level: no CPU detected".to_string()),
            );
        }
        let cpu0 = fill_path(&self.file_pattern, 0);
        if !std::path::Path::new(&cpu0).exists() {
            return (
                false,
                Some(format!(
                    "it will not be possible to change the CPU energy policy level: file '{cpu0}' not found"
                )),
            );
        }
        (true, None)
    }

    pub async fn lock(&self) -> MutexGuard<'_, SavedEnergyLevels> {
        self.saved.lock().await
    }

    async fn read_cpu_state(&self, idx: usize) -> Option<i32> {
        let path = fill_path(&self.file_pattern, idx);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match raw.trim().parse() {
                Ok(state) => Some(state),
                Err(_) => {
                    error!("could not parse CPU energy policy level ({}) from '{path}'", raw.trim());
                    None
                }
            },
            Err(e) => {
                error!("could not read file '{path}': {e}");
                None
            }
        }
    }

    pub async fn map_current_state(&self) -> Option<HashMap<usize, i32>> {
        if self.cpu_count == 0 {
            return None;
        }
        let states = join_all((0..self.cpu_count).map(|idx| self.read_cpu_state(idx))).await;
        let map: HashMap<usize, i32> = states
            .into_iter()
            .enumerate()
            .filter_map(|(idx, state)| state.map(|s| (idx, s)))
            .collect();
        if map.is_empty() {
            None
        } else {
            Some(map)
        }
    }

    async fn write_cpu_state(&self, idx: usize, state: i32) -> bool {
        let path = fill_path(&self.file_pattern, idx);
        match tokio::fs::write(&path, state.to_string()).await {
            Ok(()) => true,
            Err(e) => {
                error!("could not write '{state}' to file '{path}': {e}");
                false
            }
        }
    }

    pub async fn change_states(&self, cpu_states: &HashMap<usize, i32>) -> HashMap<usize, bool> {
        if self.cpu_count == 0 || cpu_states.is_empty() {
            return HashMap::new();
        }
        let entries: Vec<(usize, i32)> = cpu_states.iter().map(|(i, s)| (*i, *s)).collect();
        let results = join_all(entries.iter().map(|(idx, state)| self.write_cpu_state(*idx, *state))).await;
        entries.iter().map(|(idx, _)| *idx).zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(dir: &TempDir, values: &[&str]) -> String {
        for (idx, value) in values.iter().enumerate() {
            std::fs::write(dir.path().join(format!("cpu{idx}")), value).unwrap();
        }
        dir.path().join("cpu{}").to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn maps_and_changes_governors() {
        let dir = TempDir::new().unwrap();
        let pattern = fake_sysfs(&dir, &["schedutil", "ondemand"]);
        let manager = CpuFrequencyManager::with_file_pattern(2, &pattern);

        let current = manager.map_current_governors().await;
        assert_eq!(current.get("schedutil"), Some(&BTreeSet::from([0])));
        assert_eq!(current.get("ondemand"), Some(&BTreeSet::from([1])));

        let changed = manager.change_governor(GOVERNOR_PERFORMANCE, None).await;
        assert_eq!(changed, BTreeSet::from([0, 1]));

        let after = manager.map_current_governors().await;
        assert_eq!(after.get(GOVERNOR_PERFORMANCE), Some(&BTreeSet::from([0, 1])));
    }

    #[tokio::test]
    async fn missing_cpu_file_is_skipped() {
        // cpu1 has no sysfs directory at all, so reads and writes both fail
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cpu0")).unwrap();
        std::fs::write(dir.path().join("cpu0/governor"), "performance").unwrap();
        let pattern = dir.path().join("cpu{}/governor").to_string_lossy().into_owned();
        let manager = CpuFrequencyManager::with_file_pattern(2, &pattern);

        let current = manager.map_current_governors().await;
        assert_eq!(current.len(), 1);

        let changed = manager.change_governor("schedutil", Some(&BTreeSet::from([0, 1]))).await;
        assert_eq!(changed, BTreeSet::from([0]));
    }

    #[test]
    fn saved_governors_never_overwrite() {
        let mut saved = SavedGovernors::default();
        saved.save(&GovernorMap::from([("schedutil".to_string(), BTreeSet::from([0, 1]))]));
        saved.save(&GovernorMap::from([("ondemand".to_string(), BTreeSet::from([1, 2]))]));

        assert_eq!(saved.get(0), Some("schedutil"));
        assert_eq!(saved.get(1), Some("schedutil"));
        assert_eq!(saved.get(2), Some("ondemand"));

        let map = saved.as_governor_map().unwrap();
        assert_eq!(map.get("schedutil"), Some(&BTreeSet::from([0, 1])));
        assert_eq!(map.get("ondemand"), Some(&BTreeSet::from([2])));
    }

    #[tokio::test]
    async fn energy_states_round_trip() {
        let dir = TempDir::new().unwrap();
        let pattern = fake_sysfs(&dir, &["6", "8"]);
        let manager = CpuEnergyPolicyManager::with_file_pattern(2, &pattern);

        let current = manager.map_current_state().await.unwrap();
        assert_eq!(current, HashMap::from([(0, 6), (1, 8)]));

        let changed = manager
            .change_states(&HashMap::from([(0, LEVEL_PERFORMANCE), (1, LEVEL_PERFORMANCE)]))
            .await;
        assert!(changed.values().all(|ok| *ok));

        let after = manager.map_current_state().await.unwrap();
        assert_eq!(after, HashMap::from([(0, 0), (1, 0)]));
    }

    #[test]
    fn energy_saved_state_is_monotonic_and_clearable() {
        let mut saved = SavedEnergyLevels::default();
        saved.save(&HashMap::from([(0, 6)]));
        saved.save(&HashMap::from([(0, 8), (1, 4)]));
        assert_eq!(saved.view(), HashMap::from([(0, 6), (1, 4)]));

        saved.clear(&[0]);
        assert_eq!(saved.view(), HashMap::from([(1, 4)]));
        saved.clear(&[]);
        assert!(saved.is_empty());
    }
}
