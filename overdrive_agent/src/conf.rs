//! Line-oriented `key=value` parsing shared by the agent config, profiles and
//! launchers files. A bare key enables its boolean default; `#` starts a
//! comment (full-line or inline on the value side).

use once_cell::sync::Lazy;
use regex::Regex;

/// A single meaningful line: key plus optional raw value (comment stripped).
pub fn split_line(line: &str) -> Option<(&str, Option<&str>)> {
    let clean = line.trim();
    if clean.is_empty() || clean.starts_with('#') {
        return None;
    }
    match clean.split_once('=') {
        Some((key, value)) => {
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.split('#').next().unwrap_or("").trim();
            if value.is_empty() {
                Some((key, None))
            } else {
                Some((key, Some(value)))
            }
        }
        None => {
            let key = clean.split('#').next().unwrap_or("").trim();
            if key.is_empty() {
                None
            } else {
                Some((key, None))
            }
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Comma-separated integers, deduplicated and sorted. Non-numeric entries are
/// dropped.
pub fn parse_int_list(value: &str) -> Vec<usize> {
    let mut ints: Vec<usize> = value
        .split(',')
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    ints.sort_unstable();
    ints.dedup();
    ints
}

pub fn parse_str_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.to_string()).collect()
}

pub fn parse_str_set(value: &str) -> std::collections::HashSet<String> {
    value.split(',').map(|s| s.to_string()).collect()
}

/// A `k:v` map entry (one per line, repeated keys accumulate). A missing or
/// empty `v` maps to `None`.
pub fn parse_map_entry(value: &str) -> Option<(String, Option<String>)> {
    let (key, val) = match value.split_once(':') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (value.trim(), ""),
    };
    if key.is_empty() {
        return None;
    }
    if val.is_empty() {
        Some((key.to_string(), None))
    } else {
        Some((key.to_string(), Some(val.to_string())))
    }
}

static RE_INLINE_PROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z.\-_]+)\s*(=(\s*([a-zA-Z.\-_,\d:/%*]+))?)?").expect("inline prop regex")
});

/// Normalizes a one-line configuration string (`k1=v1 k2 k3=v3 ...`) into the
/// line-oriented form the profile parser consumes.
pub fn normalize_inline(config: &str) -> Option<String> {
    let mut lines = Vec::new();
    for caps in RE_INLINE_PROP.captures_iter(config) {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if key.is_empty() {
            continue;
        }
        // an '=' with no value is a malformed assignment, not a bare key
        if caps.get(2).is_some() && caps.get(4).is_none() {
            continue;
        }
        match caps.get(4) {
            Some(v) => lines.push(format!("{key}={}", v.as_str())),
            None => lines.push(key.to_string()),
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_line_strips_inline_comments() {
        assert_eq!(split_line("cpu.performance=true # always"), Some(("cpu.performance", Some("true"))));
        assert_eq!(split_line("  # full comment"), None);
        assert_eq!(split_line("gpu.performance"), Some(("gpu.performance", None)));
        assert_eq!(split_line(""), None);
    }

    #[test]
    fn bool_accepts_numeric_and_word_forms() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("yes"), None);
    }

    #[test]
    fn int_list_dedupes_and_sorts() {
        assert_eq!(parse_int_list("3,1,1,2,x"), vec![1, 2, 3]);
    }

    #[test]
    fn map_entry_allows_missing_value() {
        assert_eq!(parse_map_entry("steam:n%game.exe"), Some(("steam".into(), Some("n%game.exe".into()))));
        assert_eq!(parse_map_entry("discord"), Some(("discord".into(), None)));
        assert_eq!(parse_map_entry(":x"), None);
    }

    #[test]
    fn inline_config_becomes_lines() {
        let norm = normalize_inline("cpu.performance proc.nice=-4 scripts.after=/bin/a,/bin/b").unwrap();
        assert_eq!(norm, "cpu.performance\nproc.nice=-4\nscripts.after=/bin/a,/bin/b");
        assert!(normalize_inline("   ").is_none());
    }
}
