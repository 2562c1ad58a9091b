//! Periodic publish of the device status tables.
//!
//! Each cycle copies the dirty entries of a device under its lock, releases
//! the lock, then publishes and mirrors the copy key by key. A key whose
//! publish fails, including keys skipped while the broker is down, is marked
//! dirty again and retried on the next cycle. The first cycle after each new
//! broker connection copies the full table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::BridgeContext;
use super::watchdog::{AliveLatch, LinkTransition};
use crate::device::{SharedDevice, StatusSnapshot, ALIVE_KEY};
use crate::error::{TaskError, TransportError};
use crate::mqtt::client::BrokerClient;
use crate::mqtt::connection::LinkStatus;
use crate::mqtt::topics::TopicLayout;

/// One file per key, holding the value and a newline, for local readers.
#[derive(Debug, Clone)]
pub struct SideChannel {
    dir: PathBuf,
}

impl SideChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub async fn write(&self, key: &str, value: &str) -> std::io::Result<()> {
        tokio::fs::write(self.dir.join(key), format!("{}\n", value)).await
    }
}

/// What one publish cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub published: usize,
    pub failed: usize,
    pub mirrored: usize,
    pub heartbeat: bool,
    pub link: LinkTransition,
}

#[derive(Default)]
struct KeyCounts {
    published: usize,
    failed: usize,
    mirrored: usize,
}

pub struct StateSynchronizer {
    client: Arc<dyn BrokerClient>,
    topics: TopicLayout,
    primary: SharedDevice,
    secondary: Option<SharedDevice>,
    link: watch::Receiver<LinkStatus>,
    side_channel: SideChannel,
    interval: Duration,
    heartbeat_every: u64,
    cycle: u64,
    synced_connects: usize,
    latch: AliveLatch,
}

impl StateSynchronizer {
    pub fn new(context: &BridgeContext) -> Self {
        Self {
            client: context.client.clone(),
            topics: context.topics.clone(),
            primary: context.primary.clone(),
            secondary: context.secondary.clone(),
            link: context.link.clone(),
            side_channel: SideChannel::new(&context.settings.side_channel_dir),
            interval: context.settings.publish_interval(),
            heartbeat_every: context.settings.heartbeat_every.max(1),
            cycle: 0,
            synced_connects: 0,
            latch: AliveLatch::default(),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Publishes forever. Per-key failures never end the loop.
    pub async fn run(&mut self) -> Result<(), TaskError> {
        info!(
            "Publishing status every {:?} to {}",
            self.interval,
            self.topics.status("")
        );
        loop {
            tokio::time::sleep(self.interval).await;
            let report = self.run_cycle().await;
            debug!("{:?}", report);
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        if let Err(e) = self.side_channel.prepare().await {
            debug!(
                "Side-channel directory {} unavailable: {}",
                self.side_channel.dir().display(),
                e
            );
        }

        let dirty_only = !self.reconnected();
        if !dirty_only {
            info!("Broker connection is new, publishing full status");
        }

        let (snapshot, alive) = {
            let mut device = self.primary.lock().await;
            let snapshot = device.get_all(dirty_only);
            let alive = device.table().value(ALIVE_KEY).map(str::to_string);
            (snapshot, alive)
        };
        let mut counts = self.publish_snapshot(&self.primary, &snapshot).await;

        let link = self.latch.observe(alive.as_deref());
        if link == LinkTransition::Lost {
            self.primary.lock().await.on_link_lost();
        }

        if let Some(secondary) = &self.secondary {
            let snapshot = secondary.lock().await.get_all(dirty_only);
            let secondary_counts = self.publish_snapshot(secondary, &snapshot).await;
            counts.published += secondary_counts.published;
            counts.failed += secondary_counts.failed;
            counts.mirrored += secondary_counts.mirrored;
        }

        self.cycle += 1;
        let heartbeat = self.cycle % self.heartbeat_every == 0;
        if heartbeat {
            self.primary.lock().await.table_mut().force_publish(ALIVE_KEY);
        }

        CycleReport {
            cycle: self.cycle,
            published: counts.published,
            failed: counts.failed,
            mirrored: counts.mirrored,
            heartbeat,
            link,
        }
    }

    /// True once per new broker connection, while it is up.
    fn reconnected(&mut self) -> bool {
        let status = self.link.borrow();
        if !status.is_connected() || status.connects == self.synced_connects {
            return false;
        }
        self.synced_connects = status.connects;
        true
    }

    async fn publish_snapshot(
        &self,
        device: &SharedDevice,
        snapshot: &StatusSnapshot,
    ) -> KeyCounts {
        let mut counts = KeyCounts::default();
        let mut unsent = Vec::new();
        let connected = self.link.borrow().is_connected();

        for (key, value) in snapshot.iter() {
            match self.side_channel.write(key, value).await {
                Ok(()) => counts.mirrored += 1,
                Err(e) => debug!("Side-channel write for {} failed: {}", key, e),
            }

            let result = if connected {
                self.client
                    .publish(
                        &self.topics.status(key),
                        value.as_bytes().to_vec(),
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
            } else {
                Err(TransportError::NotConnected)
            };

            match result {
                Ok(()) => {
                    debug!("Published {}={}", key, value);
                    counts.published += 1;
                }
                Err(TransportError::NotConnected) => {
                    debug!("Not connected, skipping {}", key);
                    unsent.push(key);
                }
                Err(e) => {
                    warn!("Failed to publish {}: {}", key, e);
                    unsent.push(key);
                }
            }
        }

        counts.failed = unsent.len();
        if !unsent.is_empty() {
            let mut device = device.lock().await;
            for key in unsent {
                device.table_mut().force_publish(key);
            }
        }
        counts
    }
}
