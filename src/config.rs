//! Bridge configuration, loaded once at start-up from a TOML file.
//!
//! Only `[mqtt].server` is mandatory; every other field has a default that
//! matches a stock installation on the Raspberry Pi.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;

const CONFIG_DIR: &str = "inetbox2mqtt";
const CONFIG_FILE: &str = "config.toml";

/// Topic root used when `[mqtt].topic` is empty.
pub const DEFAULT_TOPIC_ROOT: &str = "truma";

/// Serial device name that selects the loopback link.
pub const DUMMY_DEVICE: &str = "dummy";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttSettings,
    pub serial: SerialSettings,
    pub logging: LoggingSettings,
    pub options: OptionSettings,
    pub duo_control: DuoControlConfig,
    pub bridge: BridgeSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct MqttSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            topic: DEFAULT_TOPIC_ROOT.to_string(),
            client_id: "inetbox2mqtt".to_string(),
            // The broker fires the last will after this much silence
            keep_alive_secs: 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct SerialSettings {
    pub device: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: DUMMY_DEVICE.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub lin_debug: bool,
    pub inet_debug: bool,
    pub mqtt_debug: bool,
}

impl LoggingSettings {
    pub fn any_debug(&self) -> bool {
        self.lin_debug || self.inet_debug || self.mqtt_debug
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct OptionSettings {
    pub duo_control: bool,
}

/// GPIO value files of the gas bottle switch-over.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DuoControlConfig {
    pub green_input: PathBuf,
    pub red_input: PathBuf,
    pub green_output: PathBuf,
    pub red_output: PathBuf,
}

impl Default for DuoControlConfig {
    fn default() -> Self {
        Self {
            green_input: PathBuf::from("/sys/class/gpio/gpio18/value"),
            red_input: PathBuf::from("/sys/class/gpio/gpio19/value"),
            green_output: PathBuf::from("/sys/class/gpio/gpio22/value"),
            red_output: PathBuf::from("/sys/class/gpio/gpio23/value"),
        }
    }
}

/// Cadences of the supervised loops. All values in seconds.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct BridgeSettings {
    pub publish_interval_secs: u64,
    pub heartbeat_every: u64,
    pub supervisor_tick_secs: u64,
    pub connect_grace_secs: u64,
    pub publish_timeout_secs: u64,
    pub side_channel_dir: PathBuf,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            publish_interval_secs: 10,
            // 6 cycles of 10s: one heartbeat per minute
            heartbeat_every: 6,
            supervisor_tick_secs: 10,
            connect_grace_secs: 20,
            publish_timeout_secs: 5,
            side_channel_dir: PathBuf::from("/tmp/truma"),
        }
    }
}

impl BridgeSettings {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_secs(self.supervisor_tick_secs)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_secs(self.connect_grace_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl BridgeConfig {
    /// Default location: `<config dir>/inetbox2mqtt/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Reads, parses and validates a configuration file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?
        {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let config = Self::parse(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        if config.mqtt.topic.trim().is_empty() {
            debug!("Empty topic root, using {}", DEFAULT_TOPIC_ROOT);
            config.mqtt.topic = DEFAULT_TOPIC_ROOT.to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.server.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.server"));
        }
        if self.mqtt.topic.contains(['/', '#', '+']) {
            return Err(ConfigError::Invalid {
                field: "mqtt.topic",
                reason: format!("{:?} must be a single topic level", self.mqtt.topic),
            });
        }
        if self.serial.device != DUMMY_DEVICE {
            return Err(ConfigError::Invalid {
                field: "serial.device",
                reason: format!(
                    "no line decoder available for {:?}, only {:?} is supported",
                    self.serial.device, DUMMY_DEVICE
                ),
            });
        }

        let bridge = &self.bridge;
        for (field, value) in [
            ("bridge.publish_interval_secs", bridge.publish_interval_secs),
            ("bridge.heartbeat_every", bridge.heartbeat_every),
            ("bridge.supervisor_tick_secs", bridge.supervisor_tick_secs),
            ("bridge.publish_timeout_secs", bridge.publish_timeout_secs),
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}
