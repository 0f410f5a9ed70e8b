//! Script execution for the post-launch and finish hooks. Scripts run at the
//! requesting user's level unless explicitly marked `root` (and root scripts
//! additionally require the daemon-wide opt-in).

use crate::profile::ScriptSettings;
use crate::system;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

pub struct ScriptRunner {
    name: &'static str,
    root_allowed: bool,
}

impl ScriptRunner {
    pub fn new(name: &'static str, root_allowed: bool) -> Self {
        Self { name, root_allowed }
    }

    fn build_env(user_env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = match user_env {
            Some(env) => env.clone(),
            None => std::env::vars().collect(),
        };
        env.entry("DISPLAY".to_string()).or_insert_with(|| ":0".to_string());
        env.retain(|k, _| !system::BAD_USER_ENV_VARS.contains(&k.as_str()));
        env
    }

    async fn execute(
        &self,
        settings: &ScriptSettings,
        run_as: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) -> HashSet<i32> {
        let mut pids = HashSet::new();
        let env = Self::build_env(user_env);

        let valid_timeout = settings.has_valid_timeout();
        if !valid_timeout && settings.timeout.is_some() {
            warn!(
                "invalid {} scripts timeout defined: {:?}. No script will be awaited",
                self.name, settings.timeout
            );
        }
        let should_wait = settings.wait_execution || valid_timeout;

        for cmd in &settings.scripts {
            info!(
                "{} {} script: {cmd}",
                if should_wait { "Waiting" } else { "Starting" },
                self.name
            );

            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(cmd)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .env_clear()
                .envs(&env);
            if let Some(uid) = run_as {
                command.uid(uid);
            }

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!("unexpected error when running {} script '{cmd}': {e}", self.name);
                    continue;
                }
            };

            if let Some(pid) = child.id() {
                pids.insert(pid as i32);
            }

            if valid_timeout {
                let timeout = Duration::from_secs_f64(settings.timeout.unwrap_or(0.0));
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(_) => info!("{} script finished: {cmd}", self.name),
                    Err(_) => warn!("{} script '{cmd}' timed out", self.name),
                }
            } else if settings.wait_execution {
                let _ = child.wait().await;
                info!("{} script finished: {cmd}", self.name);
            }
        }

        pids
    }

    /// Runs every script group, deciding the execution level per group.
    /// Returns the pids of all started scripts.
    pub async fn run(
        &self,
        scripts: &[ScriptSettings],
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) -> HashSet<i32> {
        let current_user = nix::unistd::Uid::current().as_raw();
        let is_root = current_user == 0;
        let mut pids = HashSet::new();

        for settings in scripts {
            if settings.scripts.is_empty() {
                continue;
            }
            if is_root {
                if !settings.run_as_root && user_id.is_some_and(|id| id != 0) {
                    pids.extend(self.execute(settings, user_id, user_env).await);
                } else if self.root_allowed {
                    pids.extend(self.execute(settings, None, None).await);
                } else {
                    warn!(
                        "{} scripts {:?} are not allowed to run at the root level",
                        self.name, settings.scripts
                    );
                }
            } else if settings.run_as_root {
                warn!("cannot execute {} scripts {:?} as root user", self.name, settings.scripts);
            } else if user_id.is_none() {
                pids.extend(self.execute(settings, None, None).await);
            } else if user_id == Some(current_user) {
                pids.extend(self.execute(settings, None, user_env).await);
            } else {
                warn!(
                    "cannot execute {} scripts {:?} as user {:?}",
                    self.name, settings.scripts, user_id
                );
            }
        }

        pids
    }
}
