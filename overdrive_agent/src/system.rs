//! Process table lookups and subprocess plumbing. Everything here suspends
//! cooperatively: subprocesses go through `tokio::process`, sysfs reads are
//! done by the resource managers themselves.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

/// Environment variables never forwarded to user-level commands.
pub const BAD_USER_ENV_VARS: &[&str] = &["LD_PRELOAD"];

pub fn read_current_pids() -> HashSet<i32> {
    let mut pids = HashSet::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                pids.insert(pid);
            }
        }
    }
    pids
}

pub fn pid_exists(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

fn filter_user_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(k, _)| !BAD_USER_ENV_VARS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn shell_command(cmd: &str, custom_env: Option<&HashMap<String, String>>) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).stdin(Stdio::null());
    if let Some(env) = custom_env {
        command.env_clear().envs(filter_user_env(env));
    }
    command
}

/// Runs `cmd` through the shell and waits for it, returning the exit code and
/// the merged stdout/stderr output.
pub async fn run_shell(cmd: &str, custom_env: Option<&HashMap<String, String>>) -> (i32, Option<String>) {
    let output = match shell_command(cmd, custom_env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!("could not execute command '{cmd}': {e}");
            return (1, None);
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let code = output.status.code().unwrap_or(1);
    (code, if text.is_empty() { None } else { Some(text) })
}

/// Fire-and-forget shell execution. The child is reaped by the runtime.
pub async fn spawn_shell(cmd: &str, custom_env: Option<&HashMap<String, String>>) -> Option<u32> {
    match shell_command(cmd, custom_env)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child.id(),
        Err(e) => {
            warn!("could not spawn command '{cmd}': {e}");
            None
        }
    }
}

/// Runs `cmd` under another uid (fork + setuid + exec). Waits when asked,
/// otherwise leaves the child running.
pub async fn run_user_command(
    cmd: &str,
    user_id: u32,
    user_env: Option<&HashMap<String, String>>,
    wait: bool,
) -> (Option<u32>, Option<i32>, Option<String>) {
    let mut command = shell_command(cmd, user_env);
    command.uid(user_id);

    if wait {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("could not spawn command '{cmd}' as user {user_id}: {e}");
                return (None, Some(1), None);
            }
        };
        let pid = child.id();
        match child.wait_with_output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let out = if text.is_empty() { None } else { Some(text) };
                (pid, output.status.code(), out)
            }
            Err(e) => (pid, Some(1), Some(e.to_string())),
        }
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
        match command.spawn() {
            Ok(child) => (child.id(), None, None),
            Err(e) => {
                warn!("could not spawn command '{cmd}' as user {user_id}: {e}");
                (None, Some(1), None)
            }
        }
    }
}

fn split_ps_line(line: &str) -> Option<(i32, &str)> {
    let trimmed = line.trim();
    let (pid, rest) = trimmed.split_once('#')?;
    Some((pid.trim().parse().ok()?, rest.trim()))
}

async fn ps_lines(columns: &str, last_match: bool) -> Vec<String> {
    let sort = if last_match { "--sort=-pid" } else { "--sort=pid" };
    let cmd = format!("ps -Ao \"{columns}\" -ww --no-headers {sort}");
    let (code, output) = run_shell(&cmd, None).await;
    if code != 0 {
        return Vec::new();
    }
    output
        .map(|o| o.lines().map(|l| l.to_string()).collect())
        .unwrap_or_default()
}

/// First process whose comm matches `pattern`. `last_match` walks the table
/// from the highest pid down.
pub async fn find_process_by_name(pattern: &Regex, last_match: bool) -> Option<(i32, String)> {
    for line in ps_lines("%p#%c", last_match).await {
        if let Some((pid, name)) = split_ps_line(&line) {
            if pattern.is_match(name) {
                return Some((pid, name.to_string()));
            }
        }
    }
    None
}

/// First process whose full command line matches any of `patterns`.
pub async fn find_process_by_command(patterns: &[Regex], last_match: bool) -> Option<(i32, String)> {
    for line in ps_lines("%p#%a", last_match).await {
        if let Some((pid, cmd)) = split_ps_line(&line) {
            if patterns.iter().any(|p| p.is_match(cmd)) {
                return Some((pid, cmd.to_string()));
            }
        }
    }
    None
}

/// First pid seen for each exact command line in `commands`.
pub async fn find_processes_by_command(commands: &HashSet<String>) -> HashMap<String, i32> {
    let mut matches = HashMap::new();
    for line in ps_lines("%p#%a", false).await {
        if let Some((pid, cmd)) = split_ps_line(&line) {
            if commands.contains(cmd) && !matches.contains_key(cmd) {
                matches.insert(cmd.to_string(), pid);
                if matches.len() == commands.len() {
                    break;
                }
            }
        }
    }
    matches
}

/// First pid seen for each comm name in `names`.
pub async fn find_pids_by_names(names: &HashSet<String>) -> HashMap<String, i32> {
    let mut matches = HashMap::new();
    for line in ps_lines("%p#%c", false).await {
        if let Some((pid, name)) = split_ps_line(&line) {
            if names.contains(name) && !matches.contains_key(name) {
                matches.insert(name.to_string(), pid);
                if matches.len() == names.len() {
                    break;
                }
            }
        }
    }
    matches
}

/// Full command line of each pid in `pids`.
pub async fn find_commands_by_pids(pids: &HashSet<i32>) -> HashMap<i32, String> {
    let mut matches = HashMap::new();
    for line in ps_lines("%p#%a", false).await {
        if let Some((pid, cmd)) = split_ps_line(&line) {
            if pids.contains(&pid) && !matches.contains_key(&pid) {
                matches.insert(pid, cmd.to_string());
                if matches.len() == pids.len() {
                    break;
                }
            }
        }
    }
    matches
}

pub async fn map_pids_by_ppid() -> HashMap<i32, HashSet<i32>> {
    let mut map: HashMap<i32, HashSet<i32>> = HashMap::new();
    for line in ps_lines("%P#%p", false).await {
        let trimmed = line.trim();
        if let Some((ppid, pid)) = trimmed.split_once('#') {
            if let (Ok(ppid), Ok(pid)) = (ppid.trim().parse(), pid.trim().parse()) {
                map.entry(ppid).or_default().insert(pid);
            }
        }
    }
    map
}

/// All transitive children of `ppids`, depth-first so that the deepest
/// descendants come first.
pub async fn find_children(ppids: &HashSet<i32>) -> Vec<i32> {
    let by_ppid = map_pids_by_ppid().await;
    let mut children: Vec<i32> = Vec::new();
    let mut frontier: HashSet<i32> = ppids.clone();

    loop {
        let mut next = HashSet::new();
        for pid in &frontier {
            if let Some(direct) = by_ppid.get(pid) {
                for child in direct {
                    if !children.contains(child) && !frontier.contains(child) && !ppids.contains(child) {
                        next.insert(*child);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        let mut level: Vec<i32> = next.iter().copied().collect();
        level.sort_unstable();
        // deepest level first, matching the kill order expected downstream
        for pid in level.into_iter().rev() {
            children.insert(0, pid);
        }
        frontier = next;
    }
    children
}

static RE_ANY_OPERATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*+").expect("any operator regex"));

pub fn has_any_glob(word: &str) -> bool {
    word.contains('*')
}

/// Expands a word into an anchored matcher; `*` runs become `.+`.
pub fn map_any_regex(word: &str) -> Option<Regex> {
    if word.is_empty() {
        return None;
    }
    let pattern = if has_any_glob(word) {
        let collapsed = RE_ANY_OPERATOR.replace_all(word, "\u{0}");
        regex::escape(&collapsed).replace('\u{0}', ".+")
    } else {
        regex::escape(word)
    };
    Regex::new(&format!("^{pattern}$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_line_splits_on_first_hash() {
        assert_eq!(split_ps_line("  42#my#proc "), Some((42, "my#proc")));
        assert_eq!(split_ps_line("nope"), None);
    }

    #[test]
    fn glob_words_expand_to_anchored_patterns() {
        let re = map_any_regex("Game*.exe").unwrap();
        assert!(re.is_match("GameLauncher.exe"));
        assert!(!re.is_match("Game.exe.bak"));

        let exact = map_any_regex("steam").unwrap();
        assert!(exact.is_match("steam"));
        assert!(!exact.is_match("steam2"));
    }

    #[test]
    fn consecutive_globs_collapse() {
        let re = map_any_regex("pro**ton").unwrap();
        assert!(re.is_match("proXton"));
        assert!(!re.is_match("proton2"));
    }

    #[test]
    fn current_pids_contains_self() {
        let pids = read_current_pids();
        assert!(pids.contains(&(std::process::id() as i32)));
    }
}
