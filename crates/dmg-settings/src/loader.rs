//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HostSettings::default()`]
//! 2. If `~/.dmg-host/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DMG_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::HostSettings;

/// Resolve the path to the settings file (`~/.dmg-host/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".dmg-host").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HostSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`HostSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HostSettings> {
    let defaults = serde_json::to_value(HostSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HostSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut HostSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DMG_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("DMG_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("DMG_ROUTE") {
        settings.server.route = v;
    }
    if let Some(v) = read_env_usize("DMG_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("DMG_STEP_TIMEOUT_MS", 10, 600_000) {
        settings.server.step_timeout_ms = v;
    }

    // ── Emulator ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DMG_ROM_DIR") {
        settings.emulator.rom_dir = v;
    }
    if let Ok(v) = std::env::var("DMG_DEFAULT_ROM") {
        settings.emulator.default_rom = parse_optional_rom(&v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DMG_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("DMG_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => settings.logging.format = format,
            Err(e) => tracing::warn!(key = "DMG_LOG_FORMAT", value = %v, error = %e, "ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Empty or `none` disables the default ROM.
pub fn parse_optional_rom(val: &str) -> Option<String> {
    let trimmed = val.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
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

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
