use std::time::Duration;

use tracing::info;

use crate::device::{SharedDevice, SharedLink};
use crate::error::TaskError;

/// Drives a device link step by step. Ends only when the link fails.
pub struct DevicePoller {
    name: &'static str,
    device: SharedDevice,
    link: SharedLink,
    start_delay: Duration,
}

impl DevicePoller {
    pub fn new(
        name: &'static str,
        device: SharedDevice,
        link: SharedLink,
        start_delay: Duration,
    ) -> Self {
        Self {
            name,
            device,
            link,
            start_delay,
        }
    }

    pub async fn run(self) -> Result<(), TaskError> {
        tokio::time::sleep(self.start_delay).await;
        info!("Polling {}", self.name);

        let mut link = self.link.lock().await;
        loop {
            let pause = link.step(&self.device).await?;
            tokio::time::sleep(pause).await;
        }
    }
}
