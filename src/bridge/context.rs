use std::sync::Arc;

use tokio::sync::watch;

use crate::config::BridgeSettings;
use crate::device::SharedDevice;
use crate::mqtt::client::BrokerClient;
use crate::mqtt::connection::LinkStatus;
use crate::mqtt::topics::TopicLayout;

/// Everything the bridge tasks share, built once and cloned into each task
/// factory.
#[derive(Clone)]
pub struct BridgeContext {
    pub topics: TopicLayout,
    pub client: Arc<dyn BrokerClient>,
    pub primary: SharedDevice,
    pub secondary: Option<SharedDevice>,
    pub link: watch::Receiver<LinkStatus>,
    pub settings: BridgeSettings,
}
