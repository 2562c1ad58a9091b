//! Error taxonomy of the bridge.
//!
//! Every per-message and per-key failure is typed so the caller decides how
//! far it travels. Only [`ConfigError`] may end the process, and only before
//! the supervisor starts any task.

use std::path::PathBuf;
use std::time::Duration;

/// Broker transport failures (publish, subscribe, connect).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Broker connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Publish to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("Broker link is not connected")]
    NotConnected,
}

/// Inbound messages the router cannot interpret.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command key: {0}")]
    UnknownKey(String),

    #[error("Payload for {key} is not valid UTF-8")]
    InvalidPayload { key: String },
}

/// Failures raised by a device or its link.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{device}: unknown key {key}")]
    UnknownKey { device: String, key: String },

    #[error("{device}: invalid value {value:?} for {key}")]
    InvalidValue {
        device: String,
        key: String,
        value: String,
    },

    #[error("{device}: link I/O failed on {path}: {source}")]
    Io {
        device: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Start-up configuration problems. Fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Could not determine a configuration directory")]
    NoConfigDir,
}

/// Why a supervised task stopped.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}
