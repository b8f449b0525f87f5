//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.callrelay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LogLevel, RelaySettings};

/// Resolve the path to the settings file (`~/.callrelay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".callrelay").join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// `PORT` is honoured for compatibility with hosting platforms that inject
/// it; `CALLRELAY_PORT` wins when both are set. Invalid values are logged
/// and ignored (falling back to file/default).
pub fn apply_overrides<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server settings ─────────────────────────────────────────────
    if let Some(v) = read("PORT").and_then(|v| checked("PORT", &v, parse_u16_range(&v, 1, 65535))) {
        settings.server.port = v;
    }
    if let Some(v) = read("CALLRELAY_PORT")
        .and_then(|v| checked("CALLRELAY_PORT", &v, parse_u16_range(&v, 1, 65535)))
    {
        settings.server.port = v;
    }
    if let Some(v) = read("CALLRELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("CALLRELAY_MAX_CONNECTIONS").and_then(|v| {
        checked(
            "CALLRELAY_MAX_CONNECTIONS",
            &v,
            parse_usize_range(&v, 1, 1_000_000),
        )
    }) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read("CALLRELAY_SEND_QUEUE").and_then(|v| {
        checked("CALLRELAY_SEND_QUEUE", &v, parse_usize_range(&v, 1, 65_536))
    }) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = read("CALLRELAY_MAX_MESSAGE_BYTES").and_then(|v| {
        checked(
            "CALLRELAY_MAX_MESSAGE_BYTES",
            &v,
            parse_usize_range(&v, 1024, 64 * 1024 * 1024),
        )
    }) {
        settings.server.max_message_bytes = v;
    }

    // ── Logging settings ────────────────────────────────────────────
    if let Some(v) =
        read("CALLRELAY_LOG_LEVEL").and_then(|v| checked("CALLRELAY_LOG_LEVEL", &v, LogLevel::parse(&v)))
    {
        settings.logging.level = v;
    }
    if let Some(v) =
        read("CALLRELAY_LOG_JSON").and_then(|v| checked("CALLRELAY_LOG_JSON", &v, parse_bool(&v)))
    {
        settings.logging.json = v;
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
