//! Configuration utilities.

/// TOML configuration for both services.
pub mod config;
