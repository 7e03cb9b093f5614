//! # dmg-settings
//!
//! Configuration for the emulator host, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`HostSettings::default()`]
//! 2. **User file**: `~/.dmg-host/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DMG_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_the_published_endpoint() {
        let settings = HostSettings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.route, "/gameboy");
        assert_eq!(settings.emulator.default_rom.as_deref(), Some("tetris.gb"));
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn deep_merge_re_exported() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"y": 2});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
