use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use tracing::debug;

use super::topics::TopicLayout;
use crate::config::MqttSettings;
use crate::device::ALIVE_OFF;
use crate::error::TransportError;

/// Capacity of the request channel between client handles and the event loop.
const REQUEST_CAPACITY: usize = 100;

/// What the bridge needs from a broker connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Queues a publish. Implementations must bound how long this waits.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Queues a subscription without waiting for the event loop.
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;
}

/// [`BrokerClient`] over a rumqttc client handle.
#[derive(Clone)]
pub struct MqttClient {
    inner: AsyncClient,
    publish_timeout: Duration,
}

impl MqttClient {
    /// Creates the client handle and the event loop the connection task drives.
    ///
    /// The last will (`alive = "OFF"`, retained, QoS 0) is registered here, so
    /// an unclean disconnect is announced by the broker.
    pub fn new(
        settings: &MqttSettings,
        topics: &TopicLayout,
        publish_timeout: Duration,
    ) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.server.clone(),
            settings.port,
        );
        options
            .set_keep_alive(Duration::from_secs(settings.keep_alive_secs))
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                topics.last_will(),
                ALIVE_OFF,
                QoS::AtMostOnce,
                true,
            ));
        if !settings.user.is_empty() {
            options.set_credentials(settings.user.clone(), settings.password.clone());
        }

        let (inner, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (
            Self {
                inner,
                publish_timeout,
            },
            event_loop,
        )
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(
            self.publish_timeout,
            self.inner.publish(topic, qos, retain, payload),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout {
                topic: topic.to_string(),
                timeout: self.publish_timeout,
            }),
        }
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        debug!("Subscribing to {}", filter);
        Ok(self.inner.try_subscribe(filter, qos)?)
    }
}
