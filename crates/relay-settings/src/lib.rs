//! # relay-settings
//!
//! Layered configuration for the relay session subsystem.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`RelaySettings::default()`])
//! 2. **Settings file** (JSON, deep-merged over defaults)
//! 3. **Environment variables** (`RELAY_*` overrides, highest priority)
//!
//! There is no process-wide settings instance. The binary loads settings
//! once and hands them to each component's constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;
