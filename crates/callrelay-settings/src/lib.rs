//! # callrelay-settings
//!
//! Configuration management with layered sources for the call relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.callrelay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PORT` and `CALLRELAY_*` overrides (highest priority)
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings_from_path,
    settings_path,
};
pub use types::{LogLevel, LoggingSettings, RelaySettings, ServerSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = RelaySettings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.max_connections, 10_000);
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert!(!settings.logging.json);
    }
}
