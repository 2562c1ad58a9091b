//! Broker side of the bridge.
//!
//! ```text
//! mqtt/
//! ├── topics.rs      - Topic layout derived from the topic root
//! ├── client.rs      - BrokerClient seam and the rumqttc client
//! └── connection.rs  - Connection state and the event loop task
//! ```

pub mod client;
pub mod connection;
pub mod topics;
