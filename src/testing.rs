//! Test doubles for the broker client and devices.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;

use crate::device::{Command, Device, Sensor, StatusTable, ALIVE_KEY, ALIVE_ON};
use crate::error::{DeviceError, TransportError};
use crate::mqtt::client::BrokerClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Records publishes and subscriptions; fails publishes to chosen topics.
#[derive(Default)]
pub struct RecordingClient {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingClient {
    pub fn failing_on<'a>(topics: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            failing: Mutex::new(topics.into_iter().map(str::to_string).collect()),
            ..Self::default()
        }
    }

    /// Stops failing publishes from now on.
    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.topic).collect()
    }

    pub fn payload_of(&self, topic: &str) -> Option<String> {
        self.published()
            .into_iter()
            .rev()
            .find(|p| p.topic == topic)
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for RecordingClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if self.failing.lock().unwrap().contains(topic) {
            return Err(TransportError::Timeout {
                topic: topic.to_string(),
                timeout: Duration::ZERO,
            });
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }
}

const COMMANDS: &[Command] = &[Command {
    key: "target_temp_room",
    object_id: "target_temp_room",
    label: "set_roomtemp",
    options: &["20", "21", "22"],
}];

/// Device that records every setter call. Clones share the record.
#[derive(Debug, Clone)]
pub struct RecordingDevice {
    table: StatusTable,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    reject: bool,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self {
            table: StatusTable::with_initial(&[("target_temp_room", "20"), (ALIVE_KEY, ALIVE_ON)]),
            calls: Arc::default(),
            reject: false,
        }
    }
}

impl RecordingDevice {
    /// A device whose setter refuses every value.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn table(&self) -> &StatusTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut StatusTable {
        &mut self.table
    }

    fn set_status(&mut self, key: &str, value: &str) -> Result<(), DeviceError> {
        self.calls
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        if self.reject {
            return Err(DeviceError::InvalidValue {
                device: self.name().to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    fn sensors(&self) -> &'static [Sensor] {
        &[]
    }

    fn commands(&self) -> &'static [Command] {
        COMMANDS
    }
}
