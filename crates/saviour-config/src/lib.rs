//! Layered configuration for SAVIOUR agents.
//!
//! Layers merge deepest-first: framework base defaults, then
//! module-type defaults, then persisted overrides, then environment
//! overrides for a fixed whitelist of keys. Values are addressed by
//! dotted key path (`recording.segment_length_seconds`); keys whose
//! final segment begins with `_` are read-only.

pub mod store;
pub mod tree;

pub use store::{ConfigDelta, ConfigStore};
pub use tree::ConfigTree;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key {0} is read-only")]
    ReadOnly(String),
    #[error("path {0} traverses a non-object value")]
    NotAnObject(String),
    #[error("empty key path")]
    EmptyPath,
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Environment variables applied on load, and the key paths they map
/// to. Restricted to transport ports and share credentials.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("MODULE_CMD_PORT", "communication.command_socket_port"),
    ("MODULE_STATUS_PORT", "communication.status_socket_port"),
    ("CONTROLLER_USERNAME", "controller_username"),
    ("CONTROLLER_PASSWORD", "controller_password"),
    ("NAS_USERNAME", "nas_username"),
    ("NAS_PASSWORD", "nas_password"),
];
