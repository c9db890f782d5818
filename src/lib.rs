//! relaymq - Bidirectional MQTT message relay
//!
//! Bridges two peers over a shared MQTT broker: whatever one peer publishes
//! on its outbound topic is re-published, byte for byte, on the other peer's
//! inbound topic. Speaks MQTT v3.1.1 at QoS 0/1 over a single client
//! connection and reconnects on its own.

pub mod codec;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod routing;

pub use config::{Config, ConfigError};
pub use connection::{Command, ConnectionManager, ConnectionState, StateHandle};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::QoS;
pub use relay::{Dispatch, DispatchError, InboundMessage, Outcome, PublishDispatcher, RelayEngine};
pub use routing::{Route, RoutingTable};
