//! Agent configuration: `~/.config/overdrive/agent.conf` (non-root) falling
//! back to `/etc/overdrive/agent.conf`. Missing files mean defaults; an
//! invalid file is a fatal init error.

use crate::conf;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

pub const APP_NAME: &str = "overdrive";
pub const DEFAULT_PORT: u16 = 5087;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("'{key}' must be greater than zero (found {value})")]
    NotPositive { key: String, value: f64 },
    #[error("could not read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub encrypted_requests: bool,
    pub check_finished_interval: f64,
    pub renicer_interval: f64,
    pub launcher_mapping_timeout: f64,
    pub gpu_vendor: Option<String>,
    pub gpu_cache: bool,
    pub profile_cache: bool,
    pub pre_cache_profiles: bool,
    pub compositor: Option<String>,
    pub allow_root_scripts: bool,
    pub cpu_performance: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            encrypted_requests: false,
            check_finished_interval: 3.0,
            renicer_interval: 5.0,
            launcher_mapping_timeout: 30.0,
            gpu_vendor: None,
            gpu_cache: true,
            profile_cache: false,
            pre_cache_profiles: false,
            compositor: None,
            allow_root_scripts: false,
            cpu_performance: false,
        }
    }
}

fn parse_bool_key(key: &str, value: Option<&str>) -> Result<bool, ConfigError> {
    match value {
        None => Ok(true),
        Some(v) => conf::parse_bool(v).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
        }),
    }
}

fn parse_float_key(key: &str, value: Option<&str>) -> Result<f64, ConfigError> {
    let raw = value.ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: String::new(),
    })?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

impl AgentConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in content.lines() {
            let Some((key, value)) = conf::split_line(line) else {
                continue;
            };
            match key {
                "port" => {
                    let raw = value.unwrap_or("");
                    config.port = raw.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: raw.to_string(),
                    })?;
                }
                "request.encrypted" => config.encrypted_requests = parse_bool_key(key, value)?,
                "check_finished_interval" => {
                    config.check_finished_interval = parse_float_key(key, value)?
                }
                "renicer_interval" => config.renicer_interval = parse_float_key(key, value)?,
                "launcher_mapping_timeout" => {
                    config.launcher_mapping_timeout = parse_float_key(key, value)?
                }
                "gpu_vendor" => config.gpu_vendor = value.map(|v| v.to_lowercase()),
                "gpu_cache" => config.gpu_cache = parse_bool_key(key, value)?,
                "profile_cache" => config.profile_cache = parse_bool_key(key, value)?,
                "pre_cache_profiles" => config.pre_cache_profiles = parse_bool_key(key, value)?,
                "compositor" => config.compositor = value.map(|v| v.to_lowercase()),
                "allow_root_scripts" => config.allow_root_scripts = parse_bool_key(key, value)?,
                "cpu.performance" => config.cpu_performance = parse_bool_key(key, value)?,
                _ => warn!("unknown config property '{key}' ignored"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("check_finished_interval", self.check_finished_interval),
            ("renicer_interval", self.renicer_interval),
            ("launcher_mapping_timeout", self.launcher_mapping_timeout),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(ConfigError::NotPositive {
                    key: key.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn config_paths(user_id: u32) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if user_id != 0 {
            if let Some(dir) = dirs_next::config_dir() {
                paths.push(dir.join(APP_NAME).join("agent.conf"));
            }
        }
        paths.push(PathBuf::from(format!("/etc/{APP_NAME}/agent.conf")));
        paths
    }

    pub async fn load(user_id: u32) -> Result<Self, ConfigError> {
        for path in Self::config_paths(user_id) {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    tracing::info!("configuration loaded from '{}'", path.display());
                    return Self::parse(&content);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ConfigError::Unreadable { path, source: e }),
            }
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.check_finished_interval, 3.0);
        assert_eq!(config.renicer_interval, 5.0);
        assert_eq!(config.launcher_mapping_timeout, 30.0);
        assert!(config.gpu_cache);
        assert!(!config.encrypted_requests);
    }

    #[test]
    fn parses_known_keys_and_warns_on_unknown() {
        let config = AgentConfig::parse(
            "port=9988\nrequest.encrypted\ncheck_finished_interval=1.5\n\
             gpu_vendor=NVIDIA\ncompositor=kwin\nwhat_is_this=1\ncpu.performance=true",
        )
        .unwrap();
        assert_eq!(config.port, 9988);
        assert!(config.encrypted_requests);
        assert_eq!(config.check_finished_interval, 1.5);
        assert_eq!(config.gpu_vendor.as_deref(), Some("nvidia"));
        assert_eq!(config.compositor.as_deref(), Some("kwin"));
        assert!(config.cpu_performance);
    }

    #[test]
    fn rejects_invalid_port_and_intervals() {
        assert!(AgentConfig::parse("port=notanumber").is_err());
        assert!(AgentConfig::parse("renicer_interval=0").is_err());
        assert!(AgentConfig::parse("check_finished_interval=-2").is_err());
    }
}
