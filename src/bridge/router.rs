use std::collections::HashMap;

use rumqttc::QoS;
use tracing::{debug, info, warn};

use crate::device::{Command, SharedDevice};
use crate::error::ProtocolError;
use crate::mqtt::topics::{TopicLayout, HUB_ONLINE, HUB_STATUS_TOPIC};

/// Which device a command key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub owner: DeviceRole,
    pub command: Command,
}

/// Every key the router forwards, built once from the devices' commands.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    specs: HashMap<&'static str, CommandSpec>,
}

impl CommandTable {
    /// The primary device wins if both devices declare the same key.
    pub fn build(primary: &'static [Command], secondary: Option<&'static [Command]>) -> Self {
        let mut specs = HashMap::new();
        for command in secondary.unwrap_or_default() {
            specs.insert(
                command.key,
                CommandSpec {
                    owner: DeviceRole::Secondary,
                    command: *command,
                },
            );
        }
        for command in primary {
            specs.insert(
                command.key,
                CommandSpec {
                    owner: DeviceRole::Primary,
                    command: *command,
                },
            );
        }
        Self { specs }
    }

    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        self.specs.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// What the router did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The owning device accepted the write.
    Applied,
    /// The hub announced it is online; discovery must be refreshed.
    HubOnline,
    /// Unknown key or undecodable payload.
    Dropped,
    /// The device refused the value.
    Rejected,
    /// Not a topic the router handles.
    Ignored,
}

/// Maps inbound broker messages to device register writes.
pub struct CommandRouter {
    topics: TopicLayout,
    table: CommandTable,
    primary: SharedDevice,
    secondary: Option<SharedDevice>,
}

impl CommandRouter {
    pub fn new(
        topics: TopicLayout,
        table: CommandTable,
        primary: SharedDevice,
        secondary: Option<SharedDevice>,
    ) -> Self {
        Self {
            topics,
            table,
            primary,
            secondary,
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Handles one message. Never fails: every problem ends in a log line
    /// and an outcome.
    pub async fn on_message(&self, topic: &str, payload: &[u8], qos: QoS) -> RouteOutcome {
        if topic == HUB_STATUS_TOPIC {
            if payload == HUB_ONLINE.as_bytes() {
                info!("Hub is online, refreshing discovery");
                return RouteOutcome::HubOnline;
            }
            debug!("Hub status {:?}", String::from_utf8_lossy(payload));
            return RouteOutcome::Ignored;
        }

        let Some(key) = self.topics.command_key(topic) else {
            debug!("Ignoring message on {}", topic);
            return RouteOutcome::Ignored;
        };

        let (spec, value) = match self.decode(key, payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropping message on {}: {}", topic, e);
                return RouteOutcome::Dropped;
            }
        };

        let device = match spec.owner {
            DeviceRole::Primary => &self.primary,
            DeviceRole::Secondary => match &self.secondary {
                Some(device) => device,
                None => {
                    debug!("No secondary device for {}", key);
                    return RouteOutcome::Dropped;
                }
            },
        };

        let result = device.lock().await.set_status(key, value);
        match result {
            Ok(()) => {
                info!("Command {}={} (qos {:?})", key, value, qos);
                RouteOutcome::Applied
            }
            Err(e) => {
                warn!("Command {}={} rejected: {}", key, value, e);
                RouteOutcome::Rejected
            }
        }
    }

    fn decode<'a>(
        &self,
        key: &str,
        payload: &'a [u8],
    ) -> Result<(&CommandSpec, &'a str), ProtocolError> {
        let spec = self
            .table
            .get(key)
            .ok_or_else(|| ProtocolError::UnknownKey(key.to_string()))?;
        let value = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidPayload {
            key: key.to_string(),
        })?;
        Ok((spec, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{shared, Device, DuoControl, InetboxDevice};
    use crate::testing::RecordingDevice;

    fn router(device: &RecordingDevice) -> CommandRouter {
        let table = CommandTable::build(device.commands(), None);
        CommandRouter::new(
            TopicLayout::new("truma"),
            table,
            shared(device.clone()),
            None,
        )
    }

    #[tokio::test]
    async fn known_key_invokes_setter_once() {
        let device = RecordingDevice::default();
        let router = router(&device);

        let outcome = router
            .on_message(
                "service/truma/set/target_temp_room",
                b"21",
                QoS::AtLeastOnce,
            )
            .await;

        assert_eq!(outcome, RouteOutcome::Applied);
        assert_eq!(
            device.calls(),
            vec![("target_temp_room".to_string(), "21".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_key_reaches_no_device() {
        let device = RecordingDevice::default();
        let router = router(&device);

        let outcome = router
            .on_message("service/truma/set/unknown_key", b"1", QoS::AtLeastOnce)
            .await;

        assert_eq!(outcome, RouteOutcome::Dropped);
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn setter_errors_are_contained() {
        let device = RecordingDevice::rejecting();
        let router = router(&device);

        let outcome = router
            .on_message(
                "service/truma/set/target_temp_room",
                b"99",
                QoS::AtLeastOnce,
            )
            .await;

        assert_eq!(outcome, RouteOutcome::Rejected);
        assert_eq!(device.calls().len(), 1);
    }

    #[tokio::test]
    async fn non_utf8_payload_is_dropped() {
        let device = RecordingDevice::default();
        let router = router(&device);

        let outcome = router
            .on_message(
                "service/truma/set/target_temp_room",
                &[0xff, 0xfe],
                QoS::AtLeastOnce,
            )
            .await;

        assert_eq!(outcome, RouteOutcome::Dropped);
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn hub_status_matches_topic_and_payload_exactly() {
        let device = RecordingDevice::default();
        let router = router(&device);

        assert_eq!(
            router
                .on_message(HUB_STATUS_TOPIC, b"online", QoS::AtLeastOnce)
                .await,
            RouteOutcome::HubOnline
        );
        assert_eq!(
            router
                .on_message(HUB_STATUS_TOPIC, b"offline", QoS::AtLeastOnce)
                .await,
            RouteOutcome::Ignored
        );
        assert_eq!(
            router
                .on_message("homeassistant/status/extra", b"online", QoS::AtLeastOnce)
                .await,
            RouteOutcome::Ignored
        );
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn secondary_commands_reach_secondary_device() {
        let primary = InetboxDevice::new();
        let secondary = DuoControl::new();
        let table = CommandTable::build(primary.commands(), Some(secondary.commands()));
        let secondary = shared(secondary);
        let router = CommandRouter::new(
            TopicLayout::new("truma"),
            table,
            shared(primary),
            Some(secondary.clone()),
        );

        let outcome = router
            .on_message(
                "service/truma/set/set_duo_ctrl_gas_red",
                b"1",
                QoS::AtLeastOnce,
            )
            .await;

        assert_eq!(outcome, RouteOutcome::Applied);
        assert_eq!(
            secondary.lock().await.take_pending_writes(),
            vec![("set_duo_ctrl_gas_red".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn primary_wins_key_collisions() {
        let primary = InetboxDevice::new();
        let table = CommandTable::build(primary.commands(), Some(primary.commands()));

        assert_eq!(table.len(), primary.commands().len());
        assert!(table
            .keys()
            .all(|key| table.get(key).unwrap().owner == DeviceRole::Primary));
    }
}
