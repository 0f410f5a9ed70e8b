//! Optimization request payload accepted on `POST /`.
//! Keep this module minimal and stable: it defines the wire format.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub pid: Option<i32>,
    pub command: Option<String>,
    pub user_name: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    /// Inline configuration: replaces profile resolution entirely when set.
    #[serde(default)]
    pub config: Option<String>,
    /// Extra lines merged on top of the resolved profile before parsing.
    #[serde(default)]
    pub profile_config: Option<String>,
    /// Processes started with/for the optimized process.
    #[serde(default)]
    pub related_pids: Option<HashSet<i32>>,
    /// Forwarded to user-level commands only.
    #[serde(default)]
    pub user_env: Option<HashMap<String, String>>,
    /// Processes the launcher stopped before the target started. A `None`
    /// command means the process existed but was not actually running.
    #[serde(default)]
    pub stopped_processes: Option<HashMap<String, Option<String>>>,
    #[serde(default)]
    pub relaunch_stopped_processes: Option<bool>,
    #[serde(default)]
    pub created_at: Option<f64>,
    /// Resolved from `user_name` at ingress, never read from the wire.
    #[serde(skip)]
    pub user_id: Option<u32>,
}

impl OptimizationRequest {
    pub fn self_request() -> Self {
        Self {
            created_at: Some(now_ts()),
            ..Default::default()
        }
    }

    pub fn is_self_request(&self) -> bool {
        self.pid.is_none() && self.command.is_none() && self.user_name.is_none()
    }

    pub fn is_valid(&self) -> bool {
        self.pid.is_some_and(|p| p >= 0)
            && self.command.as_deref().is_some_and(|c| !c.is_empty())
            && self.user_name.as_deref().is_some_and(|u| !u.is_empty())
            && self.user_id.is_some()
    }

    pub fn has_full_configuration(&self) -> bool {
        self.config.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    /// Sets up required properties before handling.
    pub fn prepare(&mut self) {
        let env = self.user_env.get_or_insert_with(HashMap::new);
        if !env.contains_key("DISPLAY") {
            let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
            env.insert("DISPLAY".to_string(), display);
        }
        if self.created_at.is_none() {
            self.created_at = Some(now_ts());
        }
    }

    pub fn created_at(&self) -> f64 {
        self.created_at.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> OptimizationRequest {
        OptimizationRequest {
            pid: Some(123),
            command: Some("/usr/bin/game".to_string()),
            user_name: Some("player".to_string()),
            user_id: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn validity_requires_pid_command_user() {
        assert!(valid_request().is_valid());

        let mut no_pid = valid_request();
        no_pid.pid = None;
        assert!(!no_pid.is_valid());

        let mut negative_pid = valid_request();
        negative_pid.pid = Some(-1);
        assert!(!negative_pid.is_valid());

        let mut no_user_id = valid_request();
        no_user_id.user_id = None;
        assert!(!no_user_id.is_valid());

        let mut empty_command = valid_request();
        empty_command.command = Some(String::new());
        assert!(!empty_command.is_valid());
    }

    #[test]
    fn self_request_has_no_identity() {
        let req = OptimizationRequest::self_request();
        assert!(req.is_self_request());
        assert!(!req.is_valid());
        assert!(req.created_at.is_some());
    }

    #[test]
    fn prepare_injects_display() {
        let mut req = valid_request();
        req.prepare();
        assert!(req.user_env.as_ref().unwrap().contains_key("DISPLAY"));
    }

    #[test]
    fn wire_roundtrip_keeps_sets_as_arrays() {
        let mut req = valid_request();
        req.related_pids = Some([4, 5].into_iter().collect());
        let json = serde_json::to_string(&req).unwrap();
        let back: OptimizationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.related_pids, req.related_pids);
        // user_id never crosses the wire
        assert_eq!(back.user_id, None);
    }
}
