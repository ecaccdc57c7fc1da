//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// `~/.tether`, or `/tmp/.tether` when `HOME` is unset.
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Session store root: the configured directory, else `~/.tether/sessions`.
pub fn sessions_root(settings: &TetherSettings) -> PathBuf {
    if settings.sessions.root.is_empty() {
        tether_home().join("sessions")
    } else {
        PathBuf::from(&settings.sessions.root)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
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

/// Reject settings whose fields are individually valid but unusable together.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    let c = &settings.context;
    for (name, share) in [
        ("taskShare", c.task_share),
        ("criticalShare", c.critical_share),
        ("generalShare", c.general_share),
    ] {
        if !(0.0..=1.0).contains(&share) {
            return Err(SettingsError::InvalidValue(format!(
                "context.{name} must be within 0..=1, got {share}"
            )));
        }
    }
    let total = c.task_share + c.critical_share + c.general_share;
    if total > 1.0 + 1e-6 {
        return Err(SettingsError::InvalidValue(format!(
            "context shares sum to {total}, must not exceed 1"
        )));
    }
    if settings.refinement.trend_window < 2 {
        return Err(SettingsError::InvalidValue(
            "refinement.trendWindow must be at least 2".into(),
        ));
    }
    if settings.sessions.max_parallel_agents == 0 {
        return Err(SettingsError::InvalidValue(
            "sessions.maxParallelAgents must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable lookup.
pub fn apply_overrides_with(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_SESSIONS_DIR") {
        settings.sessions.root = v;
    }
    if let Some(v) = read("TETHER_MAX_DEPTH").and_then(|v| checked("TETHER_MAX_DEPTH", &v, parse_u64_range(&v, 0, 16))) {
        settings.sessions.max_depth = v as u32;
    }
    if let Some(v) = read("TETHER_MAX_TOTAL_CALLS")
        .and_then(|v| checked("TETHER_MAX_TOTAL_CALLS", &v, parse_u64_range(&v, 1, 100_000)))
    {
        settings.sessions.max_total_calls = v as u32;
    }
    if let Some(v) = read("TETHER_MAX_REFINEMENTS")
        .and_then(|v| checked("TETHER_MAX_REFINEMENTS", &v, parse_u64_range(&v, 0, 100)))
    {
        settings.sessions.max_refinements = v as u32;
    }
    if let Some(v) = read("TETHER_MAX_PARALLEL_AGENTS")
        .and_then(|v| checked("TETHER_MAX_PARALLEL_AGENTS", &v, parse_usize_range(&v, 1, 1024)))
    {
        settings.sessions.max_parallel_agents = v;
    }
    if let Some(v) = read("TETHER_ALLOW_NESTED_SPAWN")
        .and_then(|v| checked("TETHER_ALLOW_NESTED_SPAWN", &v, parse_bool(&v)))
    {
        settings.sessions.allow_nested_spawn = v;
    }

    // ── Quality ─────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_DEFAULT_THRESHOLD")
        .and_then(|v| checked("TETHER_DEFAULT_THRESHOLD", &v, parse_u64_range(&v, 0, 100)))
    {
        settings.quality.default_threshold = v as f64;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("TETHER_LOG_JSON").and_then(|v| checked("TETHER_LOG_JSON", &v, parse_bool(&v))) {
        settings.logging.json = v;
    }
}

fn checked<T>(name: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"sessions": {"maxDepth": 2, "maxTotalCalls": 50}});
        let source = serde_json::json!({"sessions": {"maxDepth": 1}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["sessions"]["maxDepth"], 1);
        assert_eq!(merged["sessions"]["maxTotalCalls"], 50);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null, "b": 2});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.sessions.max_total_calls, 50);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"sessions": {"maxParallelAgents": 8}, "quality": {"roleThresholds": {"writer": 60}}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sessions.max_parallel_agents, 8);
        assert_eq!(settings.sessions.max_depth, 2);
        assert_eq!(settings.quality.threshold_for("writer"), 60.0);
        // nested maps merge per key
        assert_eq!(settings.quality.threshold_for("architect"), 80.0);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::Json(_)
        ));
    }

    #[test]
    fn load_rejects_oversized_shares() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"context": {"taskShare": 0.9}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::InvalidValue(_)
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut settings = TetherSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup(&[
                ("TETHER_MAX_DEPTH", "1"),
                ("TETHER_MAX_TOTAL_CALLS", "10"),
                ("TETHER_ALLOW_NESTED_SPAWN", "yes"),
                ("TETHER_SESSIONS_DIR", "/var/tether"),
                ("TETHER_LOG_JSON", "off"),
            ]),
        );
        assert_eq!(settings.sessions.max_depth, 1);
        assert_eq!(settings.sessions.max_total_calls, 10);
        assert!(settings.sessions.allow_nested_spawn);
        assert_eq!(settings.sessions.root, "/var/tether");
        assert!(!settings.logging.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = TetherSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup(&[
                ("TETHER_MAX_TOTAL_CALLS", "0"),
                ("TETHER_MAX_PARALLEL_AGENTS", "many"),
                ("TETHER_DEFAULT_THRESHOLD", "101"),
            ]),
        );
        assert_eq!(settings.sessions.max_total_calls, 50);
        assert_eq!(settings.sessions.max_parallel_agents, 4);
        assert_eq!(settings.quality.default_threshold, 70.0);
    }

    #[test]
    fn sessions_root_prefers_configured_dir() {
        let mut settings = TetherSettings::default();
        assert!(sessions_root(&settings).ends_with(".tether/sessions"));
        settings.sessions.root = "/srv/sessions".into();
        assert_eq!(sessions_root(&settings), PathBuf::from("/srv/sessions"));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("5", 0, 16), Some(5));
        assert_eq!(parse_u64_range("17", 0, 16), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
        assert_eq!(parse_usize_range("0", 1, 10), None);
    }
}
