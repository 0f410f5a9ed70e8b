//! Minimal view of the agent configuration: the wrapper only needs the port
//! and whether requests must be encrypted.

use std::path::PathBuf;

pub const APP_NAME: &str = "overdrive";
pub const DEFAULT_PORT: u16 = 5087;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEndpoint {
    pub port: u16,
    pub encrypted_requests: bool,
}

impl Default for AgentEndpoint {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            encrypted_requests: false,
        }
    }
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

pub fn parse(content: &str) -> AgentEndpoint {
    let mut endpoint = AgentEndpoint::default();
    for line in content.lines() {
        let clean = line.trim();
        if clean.is_empty() || clean.starts_with('#') {
            continue;
        }
        let (key, value) = match clean.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.split('#').next().unwrap_or("").trim())),
            None => (clean.split('#').next().unwrap_or("").trim(), None),
        };
        match key {
            "port" => {
                if let Some(port) = value.and_then(|v| v.parse().ok()) {
                    endpoint.port = port;
                }
            }
            "request.encrypted" => {
                endpoint.encrypted_requests = match value {
                    None => true,
                    Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true"),
                };
            }
            _ => {}
        }
    }
    endpoint
}

pub async fn load(user_id: u32) -> AgentEndpoint {
    for path in config_paths(user_id) {
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            return parse(&content);
        }
    }
    AgentEndpoint::default()
}
