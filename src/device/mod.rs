//! Device model shared by the bridge tasks.
//!
//! A device is the in-memory view of one appliance: an insertion-ordered
//! status table of `(value, dirty)` entries plus a setter for register
//! writes. The byte-level line protocol lives behind [`DeviceLink`], which
//! the device-poll task drives.
//!
//! ```text
//! DeviceLink ──step()──► StatusTable ◄──set_status()── CommandRouter
//!                             │
//!                        get_all(true)
//!                             ▼
//!                      StateSynchronizer
//! ```

pub mod duo_control;
pub mod inetbox;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::DeviceError;

pub use duo_control::{DuoControl, GpioLink};
pub use inetbox::{InetboxDevice, LoopbackLink};

/// Key of the liveness entry every primary device carries.
pub const ALIVE_KEY: &str = "alive";

/// Value of [`ALIVE_KEY`] while the appliance link is down.
pub const ALIVE_OFF: &str = "OFF";

/// Value of [`ALIVE_KEY`] while the appliance link is up.
pub const ALIVE_ON: &str = "ON";

/// A device behind the lock every task shares.
pub type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

/// Wraps a device so tasks can share it.
pub fn shared(device: impl Device + 'static) -> SharedDevice {
    Arc::new(Mutex::new(Box::new(device)))
}

/// A link that outlives restarts of the task driving it.
pub type SharedLink = Arc<Mutex<Box<dyn DeviceLink>>>;

pub fn shared_link(link: impl DeviceLink + 'static) -> SharedLink {
    Arc::new(Mutex::new(Box::new(link)))
}

/// Last known register reading plus its publish flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub value: String,
    pub dirty: bool,
}

/// Insertion-ordered status table.
#[derive(Debug, Clone, Default)]
pub struct StatusTable {
    entries: Vec<(String, StatusEntry)>,
    index: HashMap<String, usize>,
}

impl StatusTable {
    /// Builds a table from initial values. Every entry starts dirty so the
    /// first publish cycle announces the full state.
    pub fn with_initial(initial: &[(&str, &str)]) -> Self {
        let mut table = Self::default();
        for (key, value) in initial {
            table.update(key, value);
        }
        table
    }

    /// Stores a value. Marks the entry dirty if the key is new or the value
    /// changed; returns whether it did.
    pub fn update(&mut self, key: &str, value: &str) -> bool {
        match self.index.get(key) {
            Some(&pos) => {
                let entry = &mut self.entries[pos].1;
                if entry.value == value {
                    return false;
                }
                entry.value = value.to_string();
                entry.dirty = true;
                true
            }
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((
                    key.to_string(),
                    StatusEntry {
                        value: value.to_string(),
                        dirty: true,
                    },
                ));
                true
            }
        }
    }

    /// Forces the entry to be published on the next cycle even if unchanged.
    pub fn force_publish(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&pos) => {
                self.entries[pos].1.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&StatusEntry> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(|entry| entry.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the table into a snapshot.
    ///
    /// With `dirty_only` the snapshot holds just the entries flagged for
    /// publishing, and their flags are cleared. Must be called under the
    /// device lock so the copy is atomic with respect to other writers.
    pub fn snapshot(&mut self, dirty_only: bool) -> StatusSnapshot {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (key, entry) in self.entries.iter_mut() {
            if dirty_only && !entry.dirty {
                continue;
            }
            entry.dirty = false;
            entries.push((key.clone(), entry.value.clone()));
        }
        StatusSnapshot { entries }
    }
}

/// Immutable point-in-time copy of a status table, in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    entries: Vec<(String, String)>,
}

impl StatusSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hub entity kind of a telemetry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn domain(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

/// A telemetry key the hub should show as a read-only entity.
#[derive(Debug, Clone, Copy)]
pub struct Sensor {
    pub key: &'static str,
    pub object_id: &'static str,
    pub component: Component,
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
}

impl Sensor {
    pub const fn plain(key: &'static str) -> Self {
        Self {
            key,
            object_id: key,
            component: Component::Sensor,
            device_class: None,
            unit: None,
        }
    }

    pub const fn temperature(key: &'static str) -> Self {
        Self {
            key,
            object_id: key,
            component: Component::Sensor,
            device_class: Some("temperature"),
            unit: Some("°C"),
        }
    }
}

/// A writable key together with the values it accepts.
///
/// The same option list feeds the router's validation and the hub's select
/// entity, so everything the router forwards is also in the catalogue.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub key: &'static str,
    pub object_id: &'static str,
    pub label: &'static str,
    pub options: &'static [&'static str],
}

impl Command {
    pub fn accepts(&self, value: &str) -> bool {
        self.options.contains(&value)
    }
}

/// In-memory view of an appliance.
pub trait Device: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn table(&self) -> &StatusTable;

    fn table_mut(&mut self) -> &mut StatusTable;

    /// Stages a register write. Rejects unknown keys and values the
    /// register does not accept; the table is left unchanged on error.
    fn set_status(&mut self, key: &str, value: &str) -> Result<(), DeviceError>;

    /// Read-only keys announced to the hub.
    fn sensors(&self) -> &'static [Sensor];

    /// Writable keys announced to the hub and routed by the bridge.
    fn commands(&self) -> &'static [Command];

    /// Drains register writes accepted by [`Device::set_status`] that the
    /// link has not sent yet.
    fn take_pending_writes(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Recovery hook run once when the watchdog sees the link go down.
    fn on_link_lost(&mut self) {}

    /// Snapshot of the status table; see [`StatusTable::snapshot`].
    fn get_all(&mut self, dirty_only: bool) -> StatusSnapshot {
        self.table_mut().snapshot(dirty_only)
    }
}

/// The line-protocol side of a device, driven by the device-poll task.
#[async_trait]
pub trait DeviceLink: Send {
    /// Runs one exchange with the appliance and applies the result to the
    /// device. Returns how long to wait before the next step.
    async fn step(&mut self, device: &SharedDevice) -> Result<Duration, DeviceError>;
}
