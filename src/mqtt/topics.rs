//! Broker topic layout for one topic root.

use crate::device::ALIVE_KEY;

/// Topic the hub announces its own lifecycle on.
pub const HUB_STATUS_TOPIC: &str = "homeassistant/status";

/// Payload the hub sends on [`HUB_STATUS_TOPIC`] after it (re)starts.
pub const HUB_ONLINE: &str = "online";

const DISCOVERY_PREFIX: &str = "homeassistant";

/// All topics derived from the configured root `<R>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    root: String,
    set_prefix: String,
    status_prefix: String,
}

impl TopicLayout {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            set_prefix: format!("service/{}/set/", root),
            status_prefix: format!("service/{}/control_status/", root),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `service/<R>/set/`
    pub fn set_prefix(&self) -> &str {
        &self.set_prefix
    }

    /// `service/<R>/set/#`
    pub fn set_filter(&self) -> String {
        format!("{}#", self.set_prefix)
    }

    /// `service/<R>/set/<key>`
    pub fn command(&self, key: &str) -> String {
        format!("{}{}", self.set_prefix, key)
    }

    /// `service/<R>/control_status/<key>`
    pub fn status(&self, key: &str) -> String {
        format!("{}{}", self.status_prefix, key)
    }

    /// Last-will topic: `service/<R>/control_status/alive`
    pub fn last_will(&self) -> String {
        self.status(ALIVE_KEY)
    }

    /// `homeassistant/<domain>/<R>/<object_id>/config`
    ///
    /// The root sits at the hub's node-id level, so bridges with different
    /// roots keep separate entities.
    pub fn discovery_config(&self, domain: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            DISCOVERY_PREFIX, domain, self.root, object_id
        )
    }

    /// Extracts the key of a command topic, if `topic` is one.
    pub fn command_key<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.set_prefix.as_str())
            .filter(|key| !key.is_empty())
    }

    /// Entity display name: `<R>_<suffix>`
    pub fn display_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.root, suffix)
    }
}
