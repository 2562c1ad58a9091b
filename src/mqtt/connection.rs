//! Broker connection task.
//!
//! The task owns nothing but a lock on the rumqttc event loop. When polling
//! fails the task ends with the transport error and the supervisor starts a
//! fresh one, which resumes polling the same event loop and so reconnects.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲                              │
//!      └────────── poll error ────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Local};
use rumqttc::{Event, EventLoop, Packet, QoS};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::BrokerClient;
use super::topics::{TopicLayout, HUB_STATUS_TOPIC};
use crate::bridge::discovery::DiscoveryManager;
use crate::bridge::router::{CommandRouter, RouteOutcome};
use crate::error::{TaskError, TransportError};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state plus a few counters for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub connects: usize,
    pub messages_received: usize,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Local>>,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Reacts to broker events; shared by every connection task instance.
pub struct Session {
    client: Arc<dyn BrokerClient>,
    topics: TopicLayout,
    router: Arc<CommandRouter>,
    discovery: Arc<DiscoveryManager>,
    status: watch::Sender<LinkStatus>,
}

impl Session {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topics: TopicLayout,
        router: Arc<CommandRouter>,
        discovery: Arc<DiscoveryManager>,
        status: watch::Sender<LinkStatus>,
    ) -> Self {
        Self {
            client,
            topics,
            router,
            discovery,
            status,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            if status.state != state {
                debug!("Connection state {:?} -> {:?}", status.state, state);
            }
            status.state = state;
        });
    }

    /// Handles one event of the broker event loop.
    ///
    /// Returns the discovery task if the event started one.
    pub async fn handle_event(&self, event: Event) -> Option<JoinHandle<()>> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => Some(self.on_connected()),
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                });
                let outcome = self
                    .router
                    .on_message(&publish.topic, &publish.payload, publish.qos)
                    .await;
                match outcome {
                    RouteOutcome::HubOnline => Some(self.spawn_discovery()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn on_connected(&self) -> JoinHandle<()> {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.connects += 1;
            status.last_error = None;
            status.last_activity = Some(Local::now());
        });
        info!("MQTT connected");

        let set_filter = self.topics.set_filter();
        for filter in [set_filter.as_str(), HUB_STATUS_TOPIC] {
            if let Err(e) = self.client.subscribe(filter, QoS::AtLeastOnce) {
                warn!("Failed to subscribe to {}: {}", filter, e);
            }
        }

        self.spawn_discovery()
    }

    /// Runs the discovery refresh off the event loop task; publishing from
    /// inside the loop would stall once the request channel is full.
    fn spawn_discovery(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let discovery = self.discovery.clone();
        tokio::spawn(async move {
            discovery.refresh(client.as_ref()).await;
        })
    }

    fn on_failure(&self, error: &TransportError) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.last_error = Some(error.to_string());
        });
        warn!("MQTT connection lost: {}", error);
    }
}

/// One supervised run of the broker event loop.
pub struct ConnectionTask {
    event_loop: Arc<Mutex<EventLoop>>,
    session: Arc<Session>,
}

impl ConnectionTask {
    pub fn new(event_loop: Arc<Mutex<EventLoop>>, session: Arc<Session>) -> Self {
        Self {
            event_loop,
            session,
        }
    }

    pub async fn run(self) -> Result<(), TaskError> {
        let mut event_loop = self.event_loop.lock().await;
        self.session.set_state(ConnectionState::Connecting);
        info!("Connecting to MQTT broker");

        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    self.session.handle_event(event).await;
                }
                Err(e) => {
                    let error = TransportError::from(e);
                    self.session.on_failure(&error);
                    return Err(error.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::discovery::DiscoveryCatalogue;
    use crate::bridge::router::CommandTable;
    use crate::device::{shared, Device, InetboxDevice};
    use crate::testing::RecordingClient;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};

    fn session(client: Arc<RecordingClient>) -> (Session, watch::Receiver<LinkStatus>) {
        let topics = TopicLayout::new("truma");
        let device = InetboxDevice::new();
        let table = CommandTable::build(device.commands(), None);
        let catalogue = DiscoveryCatalogue::new(topics.clone(), "3.0.0").with_device(&device);
        let router = Arc::new(CommandRouter::new(
            topics.clone(),
            table,
            shared(device),
            None,
        ));
        let discovery = Arc::new(DiscoveryManager::new(catalogue));
        let (tx, rx) = watch::channel(LinkStatus::default());
        (Session::new(client, topics, router, discovery, tx), rx)
    }

    #[tokio::test]
    async fn connack_subscribes_and_announces_catalogue() {
        let client = Arc::new(RecordingClient::default());
        let (session, status) = session(client.clone());

        let discovery = session
            .handle_event(Event::Incoming(Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::Success,
                false,
            ))))
            .await
            .expect("discovery task");
        discovery.await.unwrap();

        assert!(status.borrow().is_connected());
        assert_eq!(status.borrow().connects, 1);
        assert_eq!(
            client.subscriptions(),
            vec![
                "service/truma/set/#".to_string(),
                "homeassistant/status".to_string()
            ]
        );
        assert!(client
            .published_topics()
            .contains(&"service/truma/control_status/release".to_string()));
    }

    #[tokio::test]
    async fn hub_online_message_triggers_discovery() {
        let client = Arc::new(RecordingClient::default());
        let (session, status) = session(client.clone());

        let online = Publish::new(HUB_STATUS_TOPIC, QoS::AtLeastOnce, "online");
        let task = session
            .handle_event(Event::Incoming(Packet::Publish(online)))
            .await;
        task.expect("discovery task").await.unwrap();
        assert_eq!(status.borrow().messages_received, 1);
        assert!(!client.published_topics().is_empty());

        let offline = Publish::new(HUB_STATUS_TOPIC, QoS::AtLeastOnce, "offline");
        assert!(session
            .handle_event(Event::Incoming(Packet::Publish(offline)))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn failure_marks_link_disconnected() {
        let client = Arc::new(RecordingClient::default());
        let (session, status) = session(client);
        session.set_state(ConnectionState::Connected);

        session.on_failure(&TransportError::NotConnected);

        let status = status.borrow();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
    }
}
