//! Steam runtime command dissection used by the launcher mapper.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_STEAM_CMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+\s+SteamLaunch\s+AppId\s*=\s*\d+\s+--\s+(.+)").expect("steam regex"));
static RE_PROTON_CMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+/proton\s+waitforexitandrun\s+(/.+)$").expect("proton regex"));
static RE_EXE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+\.\w+)(\s+.+)?$").expect("exe regex"));

/// The command Steam actually launches, extracted from the reaper wrapper.
pub fn get_steam_runtime_command(cmd: &str) -> Option<&str> {
    RE_STEAM_CMD
        .captures(cmd)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Executable file name (with extension) from a path, dropping trailing
/// arguments.
pub fn get_exe_name(file_path: &str) -> Option<String> {
    let base = file_path.rsplit('/').next()?;
    RE_EXE_NAME
        .captures(base)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// For a Proton invocation: `(exe_name, windows_path, unix_path)`.
pub fn get_proton_exec_name_and_paths(cmd: &str) -> Option<(Option<String>, String, String)> {
    let unix_path = RE_PROTON_CMD.captures(cmd)?.get(1)?.as_str();
    let windows_path = format!("Z:{}", unix_path.replace('/', "\\"));
    Some((get_exe_name(unix_path), windows_path, unix_path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTON_CMD: &str = "/home/u/.local/share/Steam/ubuntu12_32/reaper SteamLaunch AppId=123 -- \
        /home/u/.local/share/Steam/steamapps/common/Proton/proton waitforexitandrun /games/My Game/game.exe";

    #[test]
    fn extracts_inner_steam_command() {
        let inner = get_steam_runtime_command(PROTON_CMD).unwrap();
        assert!(inner.starts_with("/home/u/.local/share/Steam/steamapps"));
        assert!(get_steam_runtime_command("/usr/bin/vim file").is_none());
    }

    #[test]
    fn proton_paths_include_windows_form() {
        let inner = get_steam_runtime_command(PROTON_CMD).unwrap();
        let (exe, win, unix) = get_proton_exec_name_and_paths(inner).unwrap();
        assert_eq!(exe.as_deref(), Some("game.exe"));
        assert_eq!(unix, "/games/My Game/game.exe");
        assert_eq!(win, "Z:\\games\\My Game\\game.exe");
    }

    #[test]
    fn native_commands_have_no_proton_paths() {
        assert!(get_proton_exec_name_and_paths("/games/native/start.sh").is_none());
    }

    #[test]
    fn exe_name_requires_extension() {
        assert_eq!(get_exe_name("/g/Game.exe -windowed").as_deref(), Some("Game.exe"));
        assert_eq!(get_exe_name("/usr/bin/game"), None);
    }
}
