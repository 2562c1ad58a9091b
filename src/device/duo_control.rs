//! Gas bottle switch-over ("DuoControl") as a secondary device.
//!
//! Two input lines report which bottle is in use, two output lines select
//! the bottle. Lines are read and written through sysfs GPIO value files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Command, Component, Device, DeviceLink, Sensor, SharedDevice, StatusTable};
use crate::config::DuoControlConfig;
use crate::error::DeviceError;

const GAS_GREEN: &str = "duo_ctrl_gas_green";
const GAS_RED: &str = "duo_ctrl_gas_red";
const SET_GAS_GREEN: &str = "set_duo_ctrl_gas_green";
const SET_GAS_RED: &str = "set_duo_ctrl_gas_red";

const INITIAL_STATUS: &[(&str, &str)] = &[
    (GAS_GREEN, "OFF"),
    (GAS_RED, "OFF"),
    (SET_GAS_GREEN, "0"),
    (SET_GAS_RED, "0"),
];

const SENSORS: &[Sensor] = &[
    Sensor {
        key: GAS_GREEN,
        object_id: GAS_GREEN,
        component: Component::BinarySensor,
        device_class: Some("gas"),
        unit: None,
    },
    Sensor {
        key: GAS_RED,
        object_id: GAS_RED,
        component: Component::BinarySensor,
        device_class: Some("gas"),
        unit: None,
    },
];

const COMMANDS: &[Command] = &[
    Command {
        key: SET_GAS_GREEN,
        object_id: SET_GAS_GREEN,
        label: "set_duo_ctrl_gas_green",
        options: &["0", "1"],
    },
    Command {
        key: SET_GAS_RED,
        object_id: SET_GAS_RED,
        label: "set_duo_ctrl_gas_red",
        options: &["0", "1"],
    },
];

#[derive(Debug)]
pub struct DuoControl {
    table: StatusTable,
    pending: Vec<(String, String)>,
}

impl Default for DuoControl {
    fn default() -> Self {
        Self::new()
    }
}

impl DuoControl {
    pub fn new() -> Self {
        Self {
            table: StatusTable::with_initial(INITIAL_STATUS),
            pending: Vec::new(),
        }
    }
}

impl Device for DuoControl {
    fn name(&self) -> &'static str {
        "duo_ctrl"
    }

    fn table(&self) -> &StatusTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut StatusTable {
        &mut self.table
    }

    fn set_status(&mut self, key: &str, value: &str) -> Result<(), DeviceError> {
        let command = COMMANDS
            .iter()
            .find(|command| command.key == key)
            .ok_or_else(|| DeviceError::UnknownKey {
                device: self.name().to_string(),
                key: key.to_string(),
            })?;
        if !command.accepts(value) {
            return Err(DeviceError::InvalidValue {
                device: self.name().to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        self.pending.retain(|(k, _)| k != key);
        self.pending.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn sensors(&self) -> &'static [Sensor] {
        SENSORS
    }

    fn commands(&self) -> &'static [Command] {
        COMMANDS
    }

    fn take_pending_writes(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.pending)
    }
}

/// Drives a [`DuoControl`] through GPIO value files.
#[derive(Debug, Clone)]
pub struct GpioLink {
    green_input: PathBuf,
    red_input: PathBuf,
    green_output: PathBuf,
    red_output: PathBuf,
    pause: Duration,
}

impl GpioLink {
    pub fn new(config: &DuoControlConfig, pause: Duration) -> Self {
        Self {
            green_input: config.green_input.clone(),
            red_input: config.red_input.clone(),
            green_output: config.green_output.clone(),
            red_output: config.red_output.clone(),
            pause,
        }
    }

    fn output_for(&self, key: &str) -> Option<&Path> {
        match key {
            SET_GAS_GREEN => Some(&self.green_output),
            SET_GAS_RED => Some(&self.red_output),
            _ => None,
        }
    }
}

async fn read_line(path: &Path) -> Result<&'static str, DeviceError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DeviceError::Io {
            device: "duo_ctrl".to_string(),
            path: path.to_path_buf(),
            source,
        })?;
    Ok(if raw.trim() == "1" { "ON" } else { "OFF" })
}

#[async_trait]
impl DeviceLink for GpioLink {
    async fn step(&mut self, device: &SharedDevice) -> Result<Duration, DeviceError> {
        let green = read_line(&self.green_input).await?;
        let red = read_line(&self.red_input).await?;

        let writes = {
            let mut device = device.lock().await;
            let table = device.table_mut();
            if table.update(GAS_GREEN, green) | table.update(GAS_RED, red) {
                info!("Gas bottle state: green={} red={}", green, red);
            }
            device.take_pending_writes()
        };

        for (key, value) in writes {
            let Some(path) = self.output_for(&key) else {
                continue;
            };
            tokio::fs::write(path, &value)
                .await
                .map_err(|source| DeviceError::Io {
                    device: "duo_ctrl".to_string(),
                    path: path.to_path_buf(),
                    source,
                })?;
            debug!("Wrote {} to {}", value, path.display());
            device.lock().await.table_mut().update(&key, &value);
        }

        Ok(self.pause)
    }
}
