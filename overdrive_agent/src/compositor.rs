//! Window compositor control. Three shapes: compositors with a CLI command
//! triple, compositors managed by killing/relaunching their process, and the
//! NVIDIA composition pipeline toggled through `nvidia-settings`.
//!
//! The per-action scratch context carries driver-specific handles discovered
//! by `is_enabled` (pid, command line, meta-mode name) into the following
//! `enable`/`disable` call.

use crate::system;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

pub type CompositorContext = HashMap<String, String>;

static RE_COMPOSITOR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"compositor\s*:\s*(.+)\s").expect("compositor name regex"));
static RE_NVIDIA_PIPELINE_ATTRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)((ForceFullCompositionPipeline|ForceCompositionPipeline)\s*=\s*\w+)")
        .expect("nvidia pipeline regex")
});

async fn run_as(
    cmd: &str,
    user_id: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> (i32, Option<String>) {
    match user_id {
        Some(uid) if uid != nix::unistd::Uid::current().as_raw() => {
            let (_, code, output) = system::run_user_command(cmd, uid, user_env, true).await;
            (code.unwrap_or(1), output)
        }
        _ => system::run_shell(cmd, user_env).await,
    }
}

#[derive(Debug, Clone)]
pub struct CliCompositor {
    name: &'static str,
    enable_cmd: &'static str,
    disable_cmd: &'static str,
    is_enabled_cmd: &'static str,
}

impl CliCompositor {
    fn can_be_managed(&self) -> (bool, Option<String>) {
        for cmd in [self.enable_cmd, self.disable_cmd, self.is_enabled_cmd] {
            let binary = cmd.split(' ').next().unwrap_or(cmd);
            if which::which(binary).is_err() {
                return (false, Some(format!("'{binary}' is not installed")));
            }
        }
        (true, None)
    }

    async fn is_enabled(
        &self,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) -> Option<bool> {
        let (code, output) = run_as(self.is_enabled_cmd, user_id, user_env).await;
        if code != 0 {
            error!(
                "could not determine if {} is enabled. Command '{}' failed (exitcode={code})",
                self.name, self.is_enabled_cmd
            );
            return None;
        }
        match output.as_deref().map(|o| o.trim().to_lowercase()) {
            Some(state) if state == "true" => Some(true),
            Some(state) if state == "false" => Some(false),
            Some(_) => {
                warn!(
                    "could not determine if {} is enabled. Unknown output from command '{}'",
                    self.name, self.is_enabled_cmd
                );
                None
            }
            None => {
                error!(
                    "could not determine if {} is enabled. No output from command: {}",
                    self.name, self.is_enabled_cmd
                );
                None
            }
        }
    }

    async fn set_enabled(
        &self,
        enable: bool,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
    ) -> bool {
        let cmd = if enable { self.enable_cmd } else { self.disable_cmd };
        let (code, _) = run_as(cmd, user_id, user_env).await;
        if code != 0 {
            error!(
                "could not {} {}. Command ({cmd}) failed",
                if enable { "enable" } else { "disable" },
                self.name
            );
        }
        code == 0
    }
}

#[derive(Debug, Clone)]
pub struct ProcessCompositor {
    name: String,
    process_name: String,
}

impl ProcessCompositor {
    fn can_be_managed(&self) -> (bool, Option<String>) {
        if which::which(&self.process_name).is_err() {
            (false, Some(format!("'{}' is not installed", self.process_name)))
        } else {
            (true, None)
        }
    }

    async fn is_enabled(&self, context: &mut CompositorContext) -> Option<bool> {
        let pattern = system::map_any_regex(&self.process_name)?;
        match system::find_process_by_name(&pattern, false).await {
            Some((pid, _)) => {
                context.insert("pid".to_string(), pid.to_string());
                if let Some(cmd) = system::find_commands_by_pids(&HashSet::from([pid]))
                    .await
                    .remove(&pid)
                {
                    context.insert("cmd".to_string(), cmd);
                }
                Some(true)
            }
            None => Some(false),
        }
    }

    async fn enable(
        &self,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
        context: &CompositorContext,
    ) -> bool {
        let Some(cmd) = context.get("cmd") else {
            error!("enable command not available on context for compositor '{}'", self.name);
            return false;
        };
        let (code, _) = run_as(cmd, user_id, user_env).await;
        if code != 0 {
            error!("could not start window compositor '{}'. Command '{cmd}' failed", self.name);
        }
        code == 0
    }

    async fn disable(&self, context: &CompositorContext) -> bool {
        let Some(pid) = context.get("pid") else {
            error!(
                "window compositor {} process id could not be found on the context. It will not be disabled",
                self.name
            );
            return false;
        };
        let (code, _) = system::run_shell(&format!("kill -9 {pid}"), None).await;
        if code != 0 {
            error!("could not stop window compositor process '{}' (pid={pid})", self.process_name);
        }
        code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct NvidiaCompositor;

impl NvidiaCompositor {
    fn can_be_managed(&self) -> (bool, Option<String>) {
        if which::which("nvidia-settings").is_err() {
            (false, Some("'nvidia-settings' is not installed".to_string()))
        } else {
            (true, None)
        }
    }

    fn extract_attributes(output: &str) -> HashSet<String> {
        let mut by_lower: HashMap<String, String> = HashMap::new();
        for caps in RE_NVIDIA_PIPELINE_ATTRS.captures_iter(output) {
            if let Some(attr) = caps.get(2) {
                let attr = attr.as_str().trim();
                by_lower.insert(attr.to_lowercase(), attr.to_string());
            }
        }
        by_lower.into_values().collect()
    }

    async fn is_enabled(
        &self,
        user_env: Option<&HashMap<String, String>>,
        context: &mut CompositorContext,
    ) -> Option<bool> {
        let (code, output) = system::run_shell("nvidia-settings -q /CurrentMetaMode", user_env).await;
        if code != 0 {
            error!("error while checking Nvidia compositor state ('nvidia-settings' exitcode: {code})");
            return None;
        }

        let output = output.unwrap_or_default();
        let attrs = Self::extract_attributes(&output);
        if !attrs.is_empty() {
            let mode = if attrs.len() == 2 {
                "ForceFullCompositionPipeline"
            } else {
                "ForceCompositionPipeline"
            };
            context.insert("mode".to_string(), mode.to_string());
            return Some(true);
        }

        if context.contains_key("mode") {
            Some(false)
        } else {
            warn!("could not determine Nvidia compositor state from 'nvidia-settings' output");
            None
        }
    }

    async fn assign_mode(
        &self,
        enable: bool,
        user_env: Option<&HashMap<String, String>>,
        context: &CompositorContext,
    ) -> bool {
        let Some(mode) = context.get("mode") else {
            error!(
                "cannot {} the Nvidia compositor: no mode on context",
                if enable { "enable" } else { "disable" }
            );
            return false;
        };
        let meta_mode = format!("{{{mode}={}}}", if enable { "On" } else { "Off" });
        let cmd =
            format!("nvidia-settings --assign CurrentMetaMode=\"nvidia-auto-select +0+0 {meta_mode}\"");
        let (code, output) = system::run_shell(&cmd, user_env).await;

        let failed_assign = output
            .as_deref()
            .is_some_and(|o| o.to_lowercase().contains("error assigning value"));
        if code == 0 && !failed_assign {
            true
        } else {
            error!(
                "could not {} Nvidia compositor",
                if enable { "enable" } else { "disable" }
            );
            false
        }
    }
}

#[derive(Debug, Clone)]
pub enum Compositor {
    Cli(CliCompositor),
    Process(ProcessCompositor),
    Nvidia(NvidiaCompositor),
}

impl Compositor {
    pub fn kwin() -> Self {
        Self::Cli(CliCompositor {
            name: "KWin",
            enable_cmd: "qdbus org.kde.KWin /Compositor resume",
            disable_cmd: "qdbus org.kde.KWin /Compositor suspend",
            is_enabled_cmd: "qdbus org.kde.KWin /Compositor org.kde.kwin.Compositing.active",
        })
    }

    pub fn xfwm4() -> Self {
        Self::Cli(CliCompositor {
            name: "Xfwm4",
            enable_cmd: "xfconf-query --channel=xfwm4 --property=/general/use_compositing --set=true",
            disable_cmd: "xfconf-query --channel=xfwm4 --property=/general/use_compositing --set=false",
            is_enabled_cmd: "xfconf-query --channel=xfwm4 --property=/general/use_compositing",
        })
    }

    pub fn marco() -> Self {
        Self::Cli(CliCompositor {
            name: "Marco",
            enable_cmd: "gsettings set org.mate.Marco.general compositing-manager true",
            disable_cmd: "gsettings set org.mate.Marco.general compositing-manager false",
            is_enabled_cmd: "gsettings get org.mate.Marco.general compositing-manager",
        })
    }

    pub fn picom(process_name: &str) -> Self {
        let mut name = process_name.to_string();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        Self::Process(ProcessCompositor {
            name,
            process_name: process_name.to_string(),
        })
    }

    pub fn compiz() -> Self {
        Self::Process(ProcessCompositor {
            name: "Compiz".to_string(),
            process_name: "compiz".to_string(),
        })
    }

    pub fn nvidia() -> Self {
        Self::Nvidia(NvidiaCompositor)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Cli(c) => c.name,
            Self::Process(c) => &c.name,
            Self::Nvidia(_) => "Nvidia",
        }
    }

    pub fn can_be_managed(&self) -> (bool, Option<String>) {
        match self {
            Self::Cli(c) => c.can_be_managed(),
            Self::Process(c) => c.can_be_managed(),
            Self::Nvidia(c) => c.can_be_managed(),
        }
    }

    pub async fn is_enabled(
        &self,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
        context: &mut CompositorContext,
    ) -> Option<bool> {
        match self {
            Self::Cli(c) => c.is_enabled(user_id, user_env).await,
            Self::Process(c) => c.is_enabled(context).await,
            Self::Nvidia(c) => c.is_enabled(user_env, context).await,
        }
    }

    pub async fn enable(
        &self,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
        context: &CompositorContext,
    ) -> bool {
        match self {
            Self::Cli(c) => c.set_enabled(true, user_id, user_env).await,
            Self::Process(c) => c.enable(user_id, user_env, context).await,
            Self::Nvidia(c) => c.assign_mode(true, user_env, context).await,
        }
    }

    pub async fn disable(
        &self,
        user_id: Option<u32>,
        user_env: Option<&HashMap<String, String>>,
        context: &CompositorContext,
    ) -> bool {
        match self {
            Self::Cli(c) => c.set_enabled(false, user_id, user_env).await,
            Self::Process(c) => c.disable(context).await,
            Self::Nvidia(c) => c.assign_mode(false, user_env, context).await,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        let clean = name.trim().to_lowercase();
        if clean.is_empty() {
            return None;
        }
        if clean.contains("kwin") {
            Some(Self::kwin())
        } else if clean.contains("xfwm4") {
            Some(Self::xfwm4())
        } else if clean.contains("marco") || clean.contains("metacity") {
            Some(Self::marco())
        } else if clean.contains("compton") {
            Some(Self::picom("compton"))
        } else if clean.contains("picom") {
            Some(Self::picom("picom"))
        } else if clean.contains("compiz") {
            Some(Self::compiz())
        } else if clean == "nvidia" {
            Some(Self::nvidia())
        } else {
            warn!("compositor '{name}' is currently not supported");
            None
        }
    }
}

async fn inxi_read_compositor(
    user_id: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> Option<String> {
    if which::which("inxi").is_err() {
        return None;
    }
    let cmd = "inxi -Gxx -c 0";
    let (code, output) = run_as(cmd, user_id, user_env).await;
    if code != 0 {
        error!("error when executing command '{cmd}'. Could not read the current window compositor");
        return None;
    }
    match RE_COMPOSITOR_NAME.captures(output.as_deref().unwrap_or("")) {
        Some(caps) => Some(caps.get(1)?.as_str().trim().to_lowercase()),
        None => {
            warn!("command '{cmd}' did not return the window compositor name");
            None
        }
    }
}

fn guess_compositor_for_desktop(user_env: Option<&HashMap<String, String>>) -> Option<String> {
    let desktop = user_env
        .and_then(|env| env.get("XDG_CURRENT_DESKTOP"))
        .map(|d| d.to_lowercase())?;
    info!("guessing window compositor based on desktop environment: {desktop}");
    match desktop.as_str() {
        "kde" => Some("kwin".to_string()),
        "xfce" => Some("xfwm4".to_string()),
        "mate" => Some("marco".to_string()),
        _ => {
            warn!("unknown window compositor for desktop environment: {desktop}");
            None
        }
    }
}

/// Detects the running compositor via `inxi`, falling back to the desktop
/// environment hint.
pub async fn detect_compositor(
    user_id: Option<u32>,
    user_env: Option<&HashMap<String, String>>,
) -> Option<Compositor> {
    let name = match inxi_read_compositor(user_id, user_env).await {
        Some(name) => Some(name),
        None => guess_compositor_for_desktop(user_env),
    }?;
    Compositor::by_name(&name)
}

/// Daemon-wide compositor slot. Detection runs once; the disabled context is
/// present iff the daemon itself disabled the compositor, and is only touched
/// while holding this lock.
#[derive(Default)]
pub struct CompositorState {
    inner: Mutex<CompositorSlot>,
}

#[derive(Default)]
pub struct CompositorSlot {
    pub compositor: Option<Compositor>,
    pub detection_done: bool,
    pub manageable: Option<bool>,
    pub disabled_context: Option<CompositorContext>,
}

impl CompositorState {
    pub fn new(preset: Option<Compositor>) -> Self {
        Self {
            inner: Mutex::new(CompositorSlot {
                compositor: preset,
                detection_done: false,
                manageable: None,
                disabled_context: None,
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, CompositorSlot> {
        self.inner.lock().await
    }

    pub async fn is_disabled_context_set(&self) -> bool {
        self.inner.lock().await.disabled_context.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(Compositor::by_name("KWin").unwrap().name(), "KWin");
        assert_eq!(Compositor::by_name("xfwm4 4.16").unwrap().name(), "Xfwm4");
        assert_eq!(Compositor::by_name("metacity").unwrap().name(), "Marco");
        assert_eq!(Compositor::by_name("picom").unwrap().name(), "Picom");
        assert_eq!(Compositor::by_name("compton").unwrap().name(), "Compton");
        assert_eq!(Compositor::by_name("nvidia").unwrap().name(), "Nvidia");
        assert!(Compositor::by_name("mutter").is_none());
        assert!(Compositor::by_name("").is_none());
    }

    #[test]
    fn nvidia_attrs_dedupe_case_insensitively() {
        let output = "attrs: ForceCompositionPipeline=On, forcecompositionpipeline=On";
        let attrs = NvidiaCompositor::extract_attributes(output);
        assert_eq!(attrs.len(), 1);

        let output = "ForceCompositionPipeline=On ForceFullCompositionPipeline=On";
        let attrs = NvidiaCompositor::extract_attributes(output);
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn desktop_guess_covers_known_desktops() {
        for (desk, expected) in [("KDE", "kwin"), ("xfce", "xfwm4"), ("MATE", "marco")] {
            let env = HashMap::from([("XDG_CURRENT_DESKTOP".to_string(), desk.to_string())]);
            assert_eq!(guess_compositor_for_desktop(Some(&env)).as_deref(), Some(expected));
        }
        assert_eq!(guess_compositor_for_desktop(None), None);
    }
}
