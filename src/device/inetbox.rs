//! Heater/AC controller as seen through the iNet-box register set.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    Command, Device, DeviceLink, Sensor, SharedDevice, StatusTable, ALIVE_KEY, ALIVE_OFF, ALIVE_ON,
};
use crate::device::Component;
use crate::error::DeviceError;

const INITIAL_STATUS: &[(&str, &str)] = &[
    ("current_temp_room", "0"),
    ("current_temp_water", "0"),
    ("target_temp_room", "0"),
    ("target_temp_water", "0"),
    ("target_temp_aircon", "0"),
    ("energy_mix", "none"),
    ("el_power_level", "0"),
    ("heating_mode", "off"),
    ("operating_status", "0"),
    ("aircon_operating_mode", "off"),
    ("aircon_vent_mode", "low"),
    ("error_code", "0"),
    ("clock", "00:00"),
    (ALIVE_KEY, ALIVE_OFF),
];

const SENSORS: &[Sensor] = &[
    Sensor {
        key: ALIVE_KEY,
        object_id: ALIVE_KEY,
        component: Component::BinarySensor,
        device_class: Some("running"),
        unit: None,
    },
    Sensor::plain("release"),
    Sensor::temperature("current_temp_room"),
    Sensor::temperature("current_temp_water"),
    Sensor::temperature("target_temp_room"),
    Sensor::temperature("target_temp_aircon"),
    Sensor::temperature("target_temp_water"),
    Sensor::plain("energy_mix"),
    Sensor {
        key: "el_power_level",
        object_id: "el_level",
        component: Component::Sensor,
        device_class: None,
        unit: None,
    },
    Sensor::plain("heating_mode"),
    Sensor::plain("operating_status"),
    Sensor::plain("aircon_operating_mode"),
    Sensor::plain("aircon_vent_mode"),
    Sensor::plain("error_code"),
    Sensor::plain("clock"),
];

const COMMANDS: &[Command] = &[
    Command {
        key: "target_temp_room",
        object_id: "target_temp_room",
        label: "set_roomtemp",
        options: &["0", "10", "15", "18", "20", "21", "22"],
    },
    Command {
        key: "target_temp_aircon",
        object_id: "target_temp_aircon",
        label: "set_aircontemp",
        options: &["16", "18", "20", "22", "24", "26", "28"],
    },
    Command {
        key: "target_temp_water",
        object_id: "target_temp_water",
        label: "set_warmwater",
        options: &["0", "40", "60", "200"],
    },
    Command {
        key: "heating_mode",
        object_id: "heating_mode",
        label: "set_heating_mode",
        options: &["off", "eco", "high"],
    },
    Command {
        key: "aircon_operating_mode",
        object_id: "aircon_mode",
        label: "set_aircon_mode",
        options: &["off", "vent", "cool", "hot", "auto"],
    },
    Command {
        key: "aircon_vent_mode",
        object_id: "vent_mode",
        label: "set_vent_mode",
        options: &["low", "mid", "high", "night", "auto"],
    },
    Command {
        key: "energy_mix",
        object_id: "energy_mix",
        label: "set_energy_mix",
        options: &["none", "gas", "electricity", "mix"],
    },
    Command {
        key: "el_power_level",
        object_id: "el_power_level",
        label: "set_el_power_level",
        options: &["0", "900", "1800"],
    },
];

/// Primary device: the heater/AC controller on the LIN bus.
///
/// Writes are staged and handed to the link, which sends them on the bus;
/// the table only changes once the appliance reports the new value back.
#[derive(Debug)]
pub struct InetboxDevice {
    table: StatusTable,
    pending: Vec<(String, String)>,
    link_resets: u32,
}

impl Default for InetboxDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl InetboxDevice {
    pub fn new() -> Self {
        Self {
            table: StatusTable::with_initial(INITIAL_STATUS),
            pending: Vec::new(),
            link_resets: 0,
        }
    }

    pub fn pending(&self) -> &[(String, String)] {
        &self.pending
    }

    /// How often the watchdog reported the link as lost.
    pub fn link_resets(&self) -> u32 {
        self.link_resets
    }

    fn command(key: &str) -> Option<&'static Command> {
        COMMANDS.iter().find(|command| command.key == key)
    }
}

impl Device for InetboxDevice {
    fn name(&self) -> &'static str {
        "inetbox"
    }

    fn table(&self) -> &StatusTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut StatusTable {
        &mut self.table
    }

    fn set_status(&mut self, key: &str, value: &str) -> Result<(), DeviceError> {
        let command = Self::command(key).ok_or_else(|| DeviceError::UnknownKey {
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

        // A newer write to the same register replaces the staged one
        self.pending.retain(|(k, _)| k != key);
        self.pending.push((key.to_string(), value.to_string()));
        debug!("Staged write {}={}", key, value);
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

    fn on_link_lost(&mut self) {
        self.link_resets += 1;
        info!(
            "Resetting LIN link state (reset #{}), dropping {} staged writes",
            self.link_resets,
            self.pending.len()
        );
        self.pending.clear();
    }
}

/// Stand-in link used when no serial port is attached (`device = "dummy"`).
///
/// Behaves like an appliance that acknowledges every write immediately:
/// staged writes are applied to the table and the link reports alive.
#[derive(Debug)]
pub struct LoopbackLink {
    pause: Duration,
}

impl LoopbackLink {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }
}

#[async_trait]
impl DeviceLink for LoopbackLink {
    async fn step(&mut self, device: &SharedDevice) -> Result<Duration, DeviceError> {
        let mut device = device.lock().await;
        for (key, value) in device.take_pending_writes() {
            debug!("Loopback acknowledged {}={}", key, value);
            device.table_mut().update(&key, &value);
        }
        if device.table_mut().update(ALIVE_KEY, ALIVE_ON) {
            info!("LIN loopback link up");
        }
        Ok(self.pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::shared;

    #[test]
    fn rejects_unknown_keys_and_values() {
        let mut device = InetboxDevice::new();

        assert!(matches!(
            device.set_status("current_temp_room", "20"),
            Err(DeviceError::UnknownKey { .. })
        ));
        assert!(matches!(
            device.set_status("target_temp_room", "99"),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(device.take_pending_writes().is_empty());
    }

    #[test]
    fn later_write_replaces_staged_one() {
        let mut device = InetboxDevice::new();
        device.set_status("heating_mode", "eco").unwrap();
        device.set_status("target_temp_room", "20").unwrap();
        device.set_status("heating_mode", "high").unwrap();

        assert_eq!(
            device.take_pending_writes(),
            vec![
                ("target_temp_room".to_string(), "20".to_string()),
                ("heating_mode".to_string(), "high".to_string()),
            ]
        );
    }

    #[test]
    fn link_loss_drops_staged_writes() {
        let mut device = InetboxDevice::new();
        device.set_status("energy_mix", "gas").unwrap();
        device.on_link_lost();

        assert_eq!(device.link_resets(), 1);
        assert!(device.pending().is_empty());
    }

    #[test]
    fn every_command_key_is_a_status_key() {
        let device = InetboxDevice::new();
        for command in device.commands() {
            assert!(device.table().contains(command.key), "{}", command.key);
        }
    }

    #[tokio::test]
    async fn loopback_applies_writes_and_raises_alive() {
        let device = shared(InetboxDevice::new());
        device.lock().await.get_all(true);
        device
            .lock()
            .await
            .set_status("target_temp_room", "21")
            .unwrap();

        let mut link = LoopbackLink::new(Duration::from_millis(5));
        let pause = link.step(&device).await.unwrap();
        assert_eq!(pause, Duration::from_millis(5));

        let snapshot = device.lock().await.get_all(true);
        assert_eq!(snapshot.get("target_temp_room"), Some("21"));
        assert_eq!(snapshot.get(ALIVE_KEY), Some(ALIVE_ON));
        assert_eq!(snapshot.len(), 2);
    }
}
