//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClonarSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CLONAR_*` environment variable overrides (highest priority)
//! 4. Validate limits that must be non-zero
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ClonarSettings;

/// Resolve the path to the settings file (`~/.clonar/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".clonar").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClonarSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClonarSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<ClonarSettings> {
    let defaults = serde_json::to_value(ClonarSettings::default())?;

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

fn validate(settings: &ClonarSettings) -> Result<()> {
    let server = &settings.server;
    if server.heartbeat_interval_ms == 0 {
        return Err(SettingsError::InvalidValue("server.heartbeatIntervalMs must be > 0".into()));
    }
    if server.sweep_interval_ms == 0 {
        return Err(SettingsError::InvalidValue("server.sweepIntervalMs must be > 0".into()));
    }
    let a = &settings.admission;
    if a.max_concurrent == 0 {
        return Err(SettingsError::InvalidValue("admission.maxConcurrent must be > 0".into()));
    }
    if a.max_per_user == 0 {
        return Err(SettingsError::InvalidValue("admission.maxPerUser must be > 0".into()));
    }
    if a.rate_limit == 0 || a.rate_window_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "admission.rateLimit and admission.rateWindowMs must be > 0".into(),
        ));
    }
    if settings.breaker.failure_threshold == 0 {
        return Err(SettingsError::InvalidValue("breaker.failureThreshold must be > 0".into()));
    }
    if !(0.0..=1.0).contains(&settings.intent.confidence_threshold) {
        return Err(SettingsError::InvalidValue(
            "intent.confidenceThreshold must be within [0, 1]".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut ClonarSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CLONAR_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("CLONAR_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("CLONAR_HEARTBEAT_MS", 1_000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }

    // ── Admission ───────────────────────────────────────────────────
    if let Some(v) = read_env_usize("CLONAR_MAX_CONCURRENT", 1, 10_000) {
        settings.admission.max_concurrent = v;
    }
    if let Some(v) = read_env_usize("CLONAR_MAX_QUEUE", 0, 100_000) {
        settings.admission.max_queue = v;
    }
    if let Some(v) = read_env_usize("CLONAR_MAX_PER_USER", 1, 10_000) {
        settings.admission.max_per_user = v;
    }
    if let Some(v) = read_env_u32("CLONAR_RATE_LIMIT", 1, 1_000_000) {
        settings.admission.rate_limit = v;
    }
    if let Some(v) = read_env_u64("CLONAR_RATE_WINDOW_MS", 1_000, 86_400_000) {
        settings.admission.rate_window_ms = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("CLONAR_SESSION_RETENTION_MS", 1_000, 86_400_000) {
        settings.sessions.retention_ms = v;
    }
    if let Some(v) = read_env_u64("CLONAR_RECONNECT_GRACE_MS", 0, 3_600_000) {
        settings.sessions.reconnect_grace_ms = v;
    }

    // ── LLM ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CLONAR_LLM_BASE_URL") {
        settings.llm.base_url = v;
    }
    if let Some(v) = read_env_string("CLONAR_LLM_MODEL") {
        settings.llm.model = v;
    }

    // ── Tools ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SERPAPI_ENDPOINT") {
        settings.tools.serpapi_endpoint = v;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("CLONAR_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("CLONAR_LOG_TO_SQLITE") {
        settings.telemetry.log_to_sqlite = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_nested_objects() {
        let target = json!({"admission": {"maxQueue": 20, "maxConcurrent": 5}});
        let source = json!({"admission": {"maxQueue": 3}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["admission"]["maxQueue"], 3);
        assert_eq!(merged["admission"]["maxConcurrent"], 5);
    }

    #[test]
    fn deep_merge_skips_nulls_and_replaces_arrays() {
        let target = json!({"a": 1, "list": [1, 2, 3]});
        let source = json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = merge_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.admission.max_concurrent, 5);
    }

    #[test]
    fn file_values_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"admission":{"maxConcurrent":8},"sessions":{"retentionMs":60000}}"#,
        )
        .unwrap();
        let settings = merge_file(&path).unwrap();
        assert_eq!(settings.admission.max_concurrent, 8);
        assert_eq!(settings.admission.max_queue, 20);
        assert_eq!(settings.sessions.retention_ms, 60_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(merge_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut settings = ClonarSettings::default();
        settings.admission.max_concurrent = 0;
        assert!(matches!(validate(&settings), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn zero_intervals_in_file_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        std::fs::write(&path, r#"{"server":{"sweepIntervalMs":0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("sweepIntervalMs"), "got: {err}");

        std::fs::write(&path, r#"{"server":{"heartbeatIntervalMs":0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("heartbeatIntervalMs"), "got: {err}");

        std::fs::write(&path, r#"{"server":{"sweepIntervalMs":500}}"#).unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.sweep_interval_ms, 500);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u64_range("5", 10, 20), None);
        assert_eq!(parse_u32_range("30", 1, 1_000_000), Some(30));
        assert_eq!(parse_u32_range("4294967296", 1, u32::MAX), None);
        assert_eq!(parse_usize_range("abc", 0, 5), None);
    }
}
