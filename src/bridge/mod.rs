//! Bridge assembly.
//!
//! `Bridge<Configured>` holds a validated configuration. `assemble` builds
//! the topic layout, devices, command table, discovery catalogue and broker
//! client, and yields a `Bridge<Assembled>` that can hand out a supervisor
//! with every bridge task registered.

pub mod context;
pub mod discovery;
pub mod poll;
pub mod router;
pub mod synchronizer;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use rumqttc::EventLoop;
use statum::{machine, state};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BridgeConfig;
use crate::device::{
    shared, shared_link, Device, DuoControl, GpioLink, InetboxDevice, LoopbackLink, SharedLink,
};
use crate::mqtt::client::{BrokerClient, MqttClient};
use crate::mqtt::connection::{ConnectionTask, LinkStatus, Session};
use crate::mqtt::topics::TopicLayout;
use crate::supervisor::{Supervisor, TaskSpec};

pub use context::BridgeContext;
pub use discovery::{DiscoveryCatalogue, DiscoveryEntry, DiscoveryManager};
pub use router::{CommandRouter, CommandTable, RouteOutcome};
pub use synchronizer::StateSynchronizer;
pub use watchdog::AliveLatch;

/// Identifier published on `<status prefix>release` and in every descriptor.
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

const PRIMARY_START_DELAY: Duration = Duration::from_secs(1);
const PRIMARY_PAUSE: Duration = Duration::from_secs(1);
const SECONDARY_START_DELAY: Duration = Duration::from_secs(30);
const SECONDARY_PAUSE: Duration = Duration::from_secs(10);

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Configured, // Configuration validated
    Assembled,  // Devices, client and tasks wired
}

/// Shared pieces created by [`Bridge::assemble`].
pub struct Assembly {
    context: BridgeContext,
    session: Arc<Session>,
    event_loop: Arc<Mutex<EventLoop>>,
    primary_link: SharedLink,
    secondary_link: Option<SharedLink>,
}

#[machine]
pub struct Bridge<S: BridgeState> {
    config: BridgeConfig,
    assembly: Option<Assembly>,
}

impl<S: BridgeState> Bridge<S> {
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Bridge<Configured> {
    pub fn create(config: BridgeConfig) -> Self {
        info!(
            "Bridge configured for {}:{} with topic root {}",
            config.mqtt.server, config.mqtt.port, config.mqtt.topic
        );
        Self::new(config, None)
    }

    /// Wires the bridge against the configured broker.
    pub fn assemble(self) -> Bridge<Assembled> {
        let topics = TopicLayout::new(&self.config.mqtt.topic);
        let (client, event_loop) = MqttClient::new(
            &self.config.mqtt,
            &topics,
            self.config.bridge.publish_timeout(),
        );
        self.assemble_with(Arc::new(client), event_loop)
    }

    /// Wires the bridge around an existing client and its event loop.
    pub fn assemble_with(
        mut self,
        client: Arc<dyn BrokerClient>,
        event_loop: EventLoop,
    ) -> Bridge<Assembled> {
        let topics = TopicLayout::new(&self.config.mqtt.topic);

        let primary = InetboxDevice::new();
        let secondary = self.config.options.duo_control.then(DuoControl::new);

        let table = CommandTable::build(
            primary.commands(),
            secondary.as_ref().map(|device| device.commands()),
        );
        let mut catalogue = DiscoveryCatalogue::new(topics.clone(), RELEASE).with_device(&primary);
        if let Some(device) = &secondary {
            catalogue = catalogue.with_device(device);
        }
        info!(
            "Routing {} command keys, {} discovery entries",
            table.len(),
            catalogue.len()
        );

        let primary = shared(primary);
        let secondary = secondary.map(shared);
        let primary_link = shared_link(LoopbackLink::new(PRIMARY_PAUSE));
        let secondary_link = secondary
            .as_ref()
            .map(|_| shared_link(GpioLink::new(&self.config.duo_control, SECONDARY_PAUSE)));

        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let router = Arc::new(CommandRouter::new(
            topics.clone(),
            table,
            primary.clone(),
            secondary.clone(),
        ));
        let discovery = Arc::new(DiscoveryManager::new(catalogue));
        let session = Arc::new(Session::new(
            client.clone(),
            topics.clone(),
            router,
            discovery,
            status_tx,
        ));

        self.assembly = Some(Assembly {
            context: BridgeContext {
                topics,
                client,
                primary,
                secondary,
                link: status_rx,
                settings: self.config.bridge.clone(),
            },
            session,
            event_loop: Arc::new(Mutex::new(event_loop)),
            primary_link,
            secondary_link,
        });
        self.transition()
    }
}

impl Bridge<Assembled> {
    pub fn context(&self) -> Option<&BridgeContext> {
        self.assembly.as_ref().map(|assembly| &assembly.context)
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.assembly.as_ref().map(|assembly| &assembly.session)
    }

    /// A supervisor with every bridge task registered but not yet started.
    pub fn supervisor(&self) -> Supervisor {
        let settings = &self.config.bridge;
        let mut supervisor = Supervisor::new(settings.supervisor_tick(), settings.connect_grace());
        let Some(assembly) = &self.assembly else {
            return supervisor;
        };

        let event_loop = assembly.event_loop.clone();
        let session = assembly.session.clone();
        supervisor.register(
            TaskSpec::new("connection", move || {
                ConnectionTask::new(event_loop.clone(), session.clone()).run()
            })
            .deferred(),
        );

        let synchronizer = Arc::new(Mutex::new(StateSynchronizer::new(&assembly.context)));
        supervisor.register(TaskSpec::new("synchronizer", move || {
            let synchronizer = synchronizer.clone();
            async move { synchronizer.lock().await.run().await }
        }));

        let device = assembly.context.primary.clone();
        let link = assembly.primary_link.clone();
        supervisor.register(TaskSpec::new("device-poll", move || {
            poll::DevicePoller::new("inetbox", device.clone(), link.clone(), PRIMARY_START_DELAY)
                .run()
        }));

        if let (Some(device), Some(link)) = (
            assembly.context.secondary.clone(),
            assembly.secondary_link.clone(),
        ) {
            supervisor.register(TaskSpec::new("duo-control-poll", move || {
                poll::DevicePoller::new(
                    "duo_ctrl",
                    device.clone(),
                    link.clone(),
                    SECONDARY_START_DELAY,
                )
                .run()
            }));
        }

        supervisor
    }

    /// Runs every bridge task until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let supervisor = self.supervisor();
        info!("Starting {} bridge tasks", supervisor.specs().len());
        supervisor.run(shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::{ConnAck, ConnectReturnCode, Event, MqttOptions, Packet};

    use super::*;
    use crate::testing::RecordingClient;

    fn config(dir: &std::path::Path, duo_control: bool) -> BridgeConfig {
        let mut config = BridgeConfig::parse("[mqtt]\nserver = \"localhost\"\n").unwrap();
        config.bridge.side_channel_dir = dir.join("truma");
        config.options.duo_control = duo_control;
        config
    }

    fn offline_event_loop() -> EventLoop {
        let (_, event_loop) = rumqttc::AsyncClient::new(MqttOptions::new("test", "localhost", 1), 10);
        event_loop
    }

    fn task_names(supervisor: &Supervisor) -> Vec<&str> {
        supervisor.specs().iter().map(|spec| spec.name()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn boot_publishes_full_state_once_connected() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        let bridge = Bridge::create(config(dir.path(), false))
            .assemble_with(client.clone(), offline_event_loop());

        let supervisor = bridge.supervisor();
        assert_eq!(
            task_names(&supervisor),
            vec!["connection", "synchronizer", "device-poll"]
        );
        assert!(supervisor.specs()[0].is_deferred());

        let settings = &bridge.config().bridge;
        let context = bridge.context().unwrap();
        let mut synchronizer = StateSynchronizer::new(context);

        // The synchronizer starts right away, the connection after the grace period
        tokio::time::sleep(settings.publish_interval()).await;
        assert!(!context.link.borrow().is_connected());
        let first = synchronizer.run_cycle().await;
        assert_eq!(first.published, 0);
        assert!(client.published().is_empty());
        let alive = std::fs::read_to_string(dir.path().join("truma").join("alive")).unwrap();
        assert_eq!(alive, "OFF\n");

        tokio::time::sleep(settings.connect_grace() - settings.publish_interval()).await;
        let discovery = bridge
            .session()
            .unwrap()
            .handle_event(Event::Incoming(Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::Success,
                false,
            ))))
            .await
            .unwrap();
        discovery.await.unwrap();
        assert!(context.link.borrow().is_connected());

        tokio::time::sleep(settings.publish_interval()).await;
        let second = synchronizer.run_cycle().await;

        assert_eq!(second.published, first.failed);
        assert_eq!(
            client.payload_of("service/truma/control_status/alive"),
            Some("OFF".to_string())
        );
        assert!(client
            .published_topics()
            .contains(&"service/truma/control_status/current_temp_room".to_string()));
    }

    #[tokio::test]
    async fn duo_control_adds_a_poll_task() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::create(config(dir.path(), true))
            .assemble_with(Arc::new(RecordingClient::default()), offline_event_loop());

        assert_eq!(
            task_names(&bridge.supervisor()),
            vec!["connection", "synchronizer", "device-poll", "duo-control-poll"]
        );
        assert!(bridge.context().unwrap().secondary.is_some());
    }
}
