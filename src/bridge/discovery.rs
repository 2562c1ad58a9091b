//! Hub auto-discovery catalogue.
//!
//! One descriptor per telemetry or command key, published as a JSON config
//! message the hub turns into an entity. The catalogue is built at assembly
//! time and read-only afterwards.

use rumqttc::QoS;
use serde::Serialize;
use tracing::{debug, info};

use crate::device::{Command, Device, Sensor};
use crate::mqtt::client::BrokerClient;
use crate::mqtt::topics::TopicLayout;

/// Hub model string shown for every entity.
const MODEL: &str = "inetbox";

const SELECT_DOMAIN: &str = "select";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub config_topic: String,
    pub payload: String,
}

#[derive(Serialize)]
struct Descriptor<'a> {
    name: String,
    unique_id: String,
    model: &'static str,
    sw_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'static [&'static str]>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryCatalogue {
    topics: TopicLayout,
    release: String,
    entries: Vec<DiscoveryEntry>,
}

impl DiscoveryCatalogue {
    pub fn new(topics: TopicLayout, release: &str) -> Self {
        Self {
            topics,
            release: release.to_string(),
            entries: Vec::new(),
        }
    }

    /// Appends the sensors and commands a device declares.
    pub fn with_device(mut self, device: &dyn Device) -> Self {
        for sensor in device.sensors() {
            let entry = self.sensor_entry(sensor);
            self.entries.push(entry);
        }
        for command in device.commands() {
            let entry = self.command_entry(command);
            self.entries.push(entry);
        }
        debug!(
            "Discovery catalogue has {} entries after {}",
            self.entries.len(),
            device.name()
        );
        self
    }

    fn sensor_entry(&self, sensor: &Sensor) -> DiscoveryEntry {
        let descriptor = Descriptor {
            name: self.topics.display_name(sensor.key),
            unique_id: self.topics.display_name(sensor.object_id),
            model: MODEL,
            sw_version: &self.release,
            device_class: sensor.device_class,
            unit_of_measurement: sensor.unit,
            state_topic: Some(self.topics.status(sensor.key)),
            command_topic: None,
            options: None,
        };
        self.entry(sensor.component.domain(), sensor.object_id, &descriptor)
    }

    fn command_entry(&self, command: &Command) -> DiscoveryEntry {
        let descriptor = Descriptor {
            name: self.topics.display_name(command.label),
            unique_id: self.topics.display_name(command.label),
            model: MODEL,
            sw_version: &self.release,
            device_class: None,
            unit_of_measurement: None,
            state_topic: None,
            command_topic: Some(self.topics.command(command.key)),
            options: Some(command.options),
        };
        self.entry(SELECT_DOMAIN, command.object_id, &descriptor)
    }

    fn entry(&self, domain: &str, object_id: &str, descriptor: &Descriptor) -> DiscoveryEntry {
        DiscoveryEntry {
            config_topic: self.topics.discovery_config(domain, object_id),
            // Serializing plain strings and string slices cannot fail
            payload: serde_json::to_string(descriptor).unwrap_or_default(),
        }
    }

    pub fn entries(&self) -> &[DiscoveryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn release(&self) -> &str {
        &self.release
    }
}

/// Counts of one retract or publish pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub sent: usize,
    pub failed: usize,
}

impl DiscoveryReport {
    fn record(&mut self, ok: bool) {
        if ok {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub struct DiscoveryManager {
    catalogue: DiscoveryCatalogue,
    release_topic: String,
}

impl DiscoveryManager {
    pub fn new(catalogue: DiscoveryCatalogue) -> Self {
        let release_topic = catalogue.topics.status("release");
        Self {
            catalogue,
            release_topic,
        }
    }

    pub fn catalogue(&self) -> &DiscoveryCatalogue {
        &self.catalogue
    }

    /// Publishes an empty config to every entry, removing it from the hub.
    pub async fn retract(&self, client: &dyn BrokerClient) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for entry in self.catalogue.entries() {
            let result = client
                .publish(&entry.config_topic, Vec::new(), QoS::AtLeastOnce, false)
                .await;
            if let Err(e) = &result {
                debug!("Failed to retract {}: {}", entry.config_topic, e);
            }
            report.record(result.is_ok());
        }
        report
    }

    /// Announces every entry, then the release identifier.
    pub async fn publish(&self, client: &dyn BrokerClient) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for entry in self.catalogue.entries() {
            let result = client
                .publish(
                    &entry.config_topic,
                    entry.payload.clone().into_bytes(),
                    QoS::AtLeastOnce,
                    false,
                )
                .await;
            if let Err(e) = &result {
                debug!("Failed to announce {}: {}", entry.config_topic, e);
            }
            report.record(result.is_ok());
        }

        let result = client
            .publish(
                &self.release_topic,
                self.catalogue.release().as_bytes().to_vec(),
                QoS::AtLeastOnce,
                false,
            )
            .await;
        if let Err(e) = &result {
            debug!("Failed to publish release: {}", e);
        }
        report.record(result.is_ok());
        report
    }

    /// Retract then publish: clears entries of an earlier run before
    /// announcing the current catalogue.
    pub async fn refresh(&self, client: &dyn BrokerClient) -> DiscoveryReport {
        let retracted = self.retract(client).await;
        let published = self.publish(client).await;
        info!(
            "Discovery refreshed: {} retracted, {} published, {} failed",
            retracted.sent,
            published.sent,
            retracted.failed + published.failed
        );
        published
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::device::{DuoControl, InetboxDevice};
    use crate::testing::RecordingClient;

    fn manager() -> DiscoveryManager {
        let catalogue = DiscoveryCatalogue::new(TopicLayout::new("truma"), "3.0.0")
            .with_device(&InetboxDevice::new());
        DiscoveryManager::new(catalogue)
    }

    #[test]
    fn descriptors_carry_root_and_release() {
        let manager = manager();
        let alive = manager
            .catalogue()
            .entries()
            .iter()
            .find(|entry| entry.config_topic == "homeassistant/binary_sensor/truma/alive/config")
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&alive.payload).unwrap();
        assert_eq!(json["name"], "truma_alive");
        assert_eq!(json["model"], "inetbox");
        assert_eq!(json["sw_version"], "3.0.0");
        assert_eq!(json["device_class"], "running");
        assert_eq!(json["state_topic"], "service/truma/control_status/alive");
        assert!(json.get("command_topic").is_none());
    }

    #[test]
    fn select_descriptors_list_options() {
        let manager = manager();
        let entry = manager
            .catalogue()
            .entries()
            .iter()
            .find(|entry| entry.config_topic == "homeassistant/select/truma/aircon_mode/config")
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(json["name"], "truma_set_aircon_mode");
        assert_eq!(
            json["command_topic"],
            "service/truma/set/aircon_operating_mode"
        );
        assert_eq!(json["options"][2], "cool");
    }

    #[tokio::test]
    async fn retract_sends_one_empty_payload_per_entry() {
        let manager = manager();
        let client = RecordingClient::default();

        let report = manager.retract(&client).await;

        let published = client.published();
        assert_eq!(report.sent, manager.catalogue().len());
        assert_eq!(published.len(), manager.catalogue().len());
        assert!(published.iter().all(|p| p.payload.is_empty()));
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let manager = manager();

        let once = RecordingClient::default();
        manager.refresh(&once).await;

        let twice = RecordingClient::default();
        manager.refresh(&twice).await;
        manager.refresh(&twice).await;

        let pairs = |client: &RecordingClient| {
            client
                .published()
                .into_iter()
                .map(|p| (p.topic, p.payload))
                .collect::<BTreeSet<_>>()
        };
        assert_eq!(pairs(&once), pairs(&twice));
        assert_eq!(twice.published().len(), 2 * once.published().len());
    }

    #[tokio::test]
    async fn publish_ends_with_release() {
        let manager = manager();
        let client = RecordingClient::default();

        manager.publish(&client).await;

        let last = client.published().pop().unwrap();
        assert_eq!(last.topic, "service/truma/control_status/release");
        assert_eq!(last.payload, b"3.0.0".to_vec());
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let manager = manager();
        let client = RecordingClient::failing_on(["homeassistant/sensor/truma/clock/config"]);

        let report = manager.publish(&client).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, manager.catalogue().len());
    }

    #[test]
    fn secondary_device_extends_catalogue() {
        let topics = TopicLayout::new("truma");
        let primary = DiscoveryCatalogue::new(topics.clone(), "3.0.0").with_device(&InetboxDevice::new());
        let both = DiscoveryCatalogue::new(topics, "3.0.0")
            .with_device(&InetboxDevice::new())
            .with_device(&DuoControl::new());

        assert_eq!(both.len(), primary.len() + 4);
        assert!(both
            .entries()
            .iter()
            .any(|entry| entry.config_topic
                == "homeassistant/select/truma/set_duo_ctrl_gas_red/config"));
    }
}
