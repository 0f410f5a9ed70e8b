//! overdrive agent entrypoint: loads the configuration, probes the available
//! optimization tasks, applies the boot self-request and serves the request
//! endpoint on the loopback interface.

mod auth;
mod compositor;
mod conf;
mod config;
mod cpu;
mod gpu;
mod launcher;
mod mouse;
mod optimizer;
mod profile;
mod queue;
mod renicer;
mod request;
mod restore;
mod scripts;
mod state;
mod steam;
mod summary;
mod system;
mod tasks;
mod watch;
mod web;

use crate::config::AgentConfig;
use crate::optimizer::OptimizedProcess;
use crate::request::{now_ts, OptimizationRequest};
use crate::state::AppState;
use crate::tasks::TaskRegistry;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn arg_flag(name: &str) -> bool {
    std::env::args().any(|a| a == name)
}
fn arg_value(name: &str) -> Option<String> {
    let mut it = std::env::args();
    while let Some(a) = it.next() {
        if a == name {
            return it.next();
        }
    }
    None
}

/// Boot-time optimization: a synthetic request carrying no pid; only the
/// self-request-allowed environment tasks run, and no prior state is saved.
async fn apply_boot_optimizations(state: &AppState) {
    let Some(registry) = state.tasks() else {
        return;
    };
    if !state.config.cpu_performance {
        debug!("no initial optimization tasks defined");
        return;
    }

    let profile = Arc::new(profile::map_profile("cpu.performance", None, None));
    let mut request = OptimizationRequest::self_request();
    request.prepare();
    let process = OptimizedProcess::new(Arc::new(request), now_ts(), Some(profile));

    let boot_tasks = registry.runnable_env_tasks(state, &process).await;
    if boot_tasks.is_empty() {
        debug!("no initial optimization tasks defined");
        return;
    }

    debug!("waiting initial optimization tasks to complete");
    for task in boot_tasks {
        task.run(state, &process).await;
    }
    debug!("initial optimization tasks completed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    if arg_flag("--version") || arg_flag("-V") {
        println!("overdrive_agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let user_id = nix::unistd::Uid::current().as_raw();
    let mut config = match arg_value("--config") {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read config file '{path}'"))?;
            AgentConfig::parse(&content).context("invalid agent configuration")?
        }
        None => AgentConfig::load(user_id)
            .await
            .context("invalid agent configuration")?,
    };

    info!("nice levels monitoring interval: {} seconds", config.renicer_interval);
    info!("finished process checking interval: {} seconds", config.check_finished_interval);
    info!("launcher mapping timeout: {} seconds", config.launcher_mapping_timeout);
    if !config.gpu_cache {
        warn!("available GPUs cache is disabled. Available GPUs will be mapped for every request");
    }
    if config.allow_root_scripts {
        warn!("scripts are allowed to run at root level");
    }
    if config.profile_cache {
        warn!("profile caching is enabled. Changes to files require restarting");
    }

    let machine_key = if config.encrypted_requests {
        match auth::read_machine_id().await {
            Some(id) => Some(auth::derive_key(&id)),
            None => {
                warn!(
                    "'{}' not found. Request encryption is disabled",
                    auth::machine_id_path()
                );
                config.encrypted_requests = false;
                None
            }
        }
    } else {
        None
    };

    let state = AppState::new(config, machine_key);

    let registry = TaskRegistry::check_availability(&state).await;
    info!(
        "tasks available: {} environment, {} process",
        registry.env_task_count(),
        registry.proc_task_count()
    );
    let _ = state.tasks.set(registry);

    apply_boot_optimizations(&state).await;

    if state.config.profile_cache && state.config.pre_cache_profiles {
        state.profiles.pre_cache().await;
    }

    let port = state.config.port;
    let app = web::router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("ready and listening on http://{addr}/");
    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("could not bind port {port}"))?;
    Ok(())
}
