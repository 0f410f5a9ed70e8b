//! Mouse cursor hiding through an `unclutter` helper process.
//!
//! Tri-state ownership: `None` means unknown/not acting, `Some(false)` means
//! the cursor was already hidden by someone else, `Some(true)` means this
//! daemon hid it (and must restore it).

use crate::system;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const HELPER_PROCESS: &str = "unclutter";
const HIDE_CMD: &str = "unclutter --timeout 1 -b";

static RE_HELPER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{HELPER_PROCESS}$")).expect("helper regex"));

pub struct MouseCursorManager {
    cursor_hidden: Mutex<Option<bool>>,
    renicing: bool,
}

impl MouseCursorManager {
    pub fn new() -> Self {
        Self::with_renicing(true)
    }

    pub fn with_renicing(renicing: bool) -> Self {
        Self {
            cursor_hidden: Mutex::new(None),
            renicing,
        }
    }

    pub fn can_work(&self) -> (bool, Option<String>) {
        if which::which(HELPER_PROCESS).is_err() {
            (
                false,
                Some(format!(
                    "'{HELPER_PROCESS}' is not installed. It will not be possible to hide the mouse cursor"
                )),
            )
        } else {
            (true, None)
        }
    }

    fn custom_env(user_env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = match user_env {
            Some(env) => env.clone(),
            None => std::env::vars().collect(),
        };
        let display_missing = env.get("DISPLAY").map(|d| d.trim().is_empty()).unwrap_or(true);
        if display_missing {
            env.insert("DISPLAY".to_string(), ":0".to_string());
        }
        env
    }

    async fn renice_helper() {
        let names = std::collections::HashSet::from([HELPER_PROCESS.to_string()]);
        let found = system::find_pids_by_names(&names).await;
        match found.get(HELPER_PROCESS) {
            Some(pid) => {
                let res = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, *pid as libc::id_t, 1) };
                if res == 0 {
                    debug!("'{HELPER_PROCESS}' reniced to '1'");
                } else {
                    warn!("could not renice '{HELPER_PROCESS}'");
                }
            }
            None => warn!("could not renice '{HELPER_PROCESS}': process not found"),
        }
    }

    /// Idempotent: returns false when the helper is already running (cursor
    /// hidden externally) and remembers that this daemon does not own it.
    pub async fn hide_cursor(
        &self,
        user_request: bool,
        user_env: Option<&HashMap<String, String>>,
    ) -> bool {
        let mut hidden = self.cursor_hidden.lock().await;

        if system::find_process_by_name(&RE_HELPER, false).await.is_some() {
            warn!("mouse cursor is already hidden");
            if hidden.is_none() {
                // the helper was initialized by a different process
                *hidden = Some(false);
            }
            return false;
        }

        debug!("hiding the mouse cursor: {HIDE_CMD}");
        let (code, _) = system::run_shell(HIDE_CMD, Some(&Self::custom_env(user_env))).await;
        if code == 0 {
            info!("mouse cursor hidden");
            *hidden = Some(user_request);
            if self.renicing {
                tokio::spawn(Self::renice_helper());
            }
            true
        } else {
            error!("could not hide the mouse cursor: {HELPER_PROCESS} returned an unexpected code ({code})");
            false
        }
    }

    pub async fn is_cursor_hidden(&self) -> Option<bool> {
        *self.cursor_hidden.lock().await
    }

    /// Kills the helper when it is running; always resets the tri-state on
    /// success.
    pub async fn show_cursor(&self) -> Option<bool> {
        let mut hidden = self.cursor_hidden.lock().await;

        if system::find_process_by_name(&RE_HELPER, false).await.is_some() {
            let (code, _) = system::run_shell(&format!("killall {HELPER_PROCESS}"), None).await;
            if code == 0 {
                info!("displaying mouse cursor");
                *hidden = None;
                Some(true)
            } else {
                error!(
                    "could not display mouse cursor. Not all '{HELPER_PROCESS}' instances could be killed"
                );
                Some(false)
            }
        } else {
            info!("mouse cursor is already being displayed: '{HELPER_PROCESS}' is not running");
            *hidden = None;
            Some(true)
        }
    }
}

impl Default for MouseCursorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_env_fills_empty_display() {
        let env = MouseCursorManager::custom_env(Some(&HashMap::from([(
            "DISPLAY".to_string(),
            "  ".to_string(),
        )])));
        assert_eq!(env.get("DISPLAY").map(String::as_str), Some(":0"));

        let kept = MouseCursorManager::custom_env(Some(&HashMap::from([(
            "DISPLAY".to_string(),
            ":1".to_string(),
        )])));
        assert_eq!(kept.get("DISPLAY").map(String::as_str), Some(":1"));
    }

    #[tokio::test]
    async fn tri_state_starts_unknown() {
        let manager = MouseCursorManager::with_renicing(false);
        assert_eq!(manager.is_cursor_hidden().await, None);
    }
}
