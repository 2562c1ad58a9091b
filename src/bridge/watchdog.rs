use tracing::{info, warn};

use crate::device::ALIVE_OFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    Lost,
    Restored,
    Unchanged,
}

/// Edge detector on the device's `alive` value.
///
/// Reports a lost link once per OFF run, no matter how many cycles the
/// device stays OFF.
#[derive(Debug, Default)]
pub struct AliveLatch {
    last_observed_off: bool,
}

impl AliveLatch {
    pub fn is_set(&self) -> bool {
        self.last_observed_off
    }

    /// Feeds one observation. A missing value counts as up.
    pub fn observe(&mut self, alive: Option<&str>) -> LinkTransition {
        match (alive == Some(ALIVE_OFF), self.last_observed_off) {
            (true, false) => {
                self.last_observed_off = true;
                warn!("Appliance link lost");
                LinkTransition::Lost
            }
            (false, true) => {
                self.last_observed_off = false;
                info!("Appliance link restored");
                LinkTransition::Restored
            }
            _ => LinkTransition::Unchanged,
        }
    }
}
