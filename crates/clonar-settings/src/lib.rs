//! # clonar-settings
//!
//! Layered configuration for the query orchestration runtime.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults** : [`ClonarSettings::default()`]
//! 2. **User file** : `~/.clonar/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables** : `CLONAR_*` overrides (highest priority)
//!
//! The loaded value is passed explicitly to every component that needs it;
//! there is no process-global settings instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
