//! Shared daemon state: resource managers, processing queue, watcher and task
//! registry. Cloning is cheap; every interior field owns its own lock.

use crate::compositor::{Compositor, CompositorState};
use crate::config::AgentConfig;
use crate::cpu::{get_cpu_count, CpuEnergyPolicyManager, CpuFrequencyManager};
use crate::gpu::{GpuManager, GpuVendor};
use crate::mouse::MouseCursorManager;
use crate::profile::ProfileReader;
use crate::queue::ProcessingQueue;
use crate::renicer::Renicer;
use crate::tasks::TaskRegistry;
use crate::watch::ProcessWatcher;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub cpu_count: usize,
    pub cpufreq: Arc<CpuFrequencyManager>,
    pub cpu_energy: Arc<CpuEnergyPolicyManager>,
    pub gpus: Arc<GpuManager>,
    pub mouse: Arc<MouseCursorManager>,
    pub compositor: Arc<CompositorState>,
    pub queue: Arc<ProcessingQueue>,
    pub watcher: Arc<ProcessWatcher>,
    pub renicer: Arc<Renicer>,
    pub profiles: Arc<ProfileReader>,
    pub tasks: Arc<OnceCell<TaskRegistry>>,
    pub machine_key: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(config: AgentConfig, machine_key: Option<[u8; 32]>) -> Self {
        let cpu_count = get_cpu_count();

        let gpu_vendor = config.gpu_vendor.as_deref().and_then(|vendor| {
            let parsed = GpuVendor::from_str(vendor);
            if parsed.is_none() {
                warn!("invalid pre-defined GPU vendor: {vendor}");
            } else {
                info!("pre-defined GPU vendor: {vendor}");
            }
            parsed
        });

        let preset_compositor = config.compositor.as_deref().and_then(|name| {
            let compositor = Compositor::by_name(name);
            if let Some(compositor) = &compositor {
                info!("predefined window compositor: {}", compositor.name());
            }
            compositor
        });

        Self {
            cpu_count,
            cpufreq: Arc::new(CpuFrequencyManager::new(cpu_count)),
            cpu_energy: Arc::new(CpuEnergyPolicyManager::new(cpu_count)),
            gpus: Arc::new(GpuManager::new(config.gpu_cache, gpu_vendor)),
            mouse: Arc::new(MouseCursorManager::new()),
            compositor: Arc::new(CompositorState::new(preset_compositor)),
            queue: Arc::new(ProcessingQueue::new()),
            watcher: Arc::new(ProcessWatcher::new(config.check_finished_interval)),
            renicer: Arc::new(Renicer::new(config.renicer_interval)),
            profiles: Arc::new(ProfileReader::new(config.profile_cache)),
            tasks: Arc::new(OnceCell::new()),
            machine_key,
            config: Arc::new(config),
        }
    }

    pub fn tasks(&self) -> Option<&TaskRegistry> {
        self.tasks.get()
    }
}
