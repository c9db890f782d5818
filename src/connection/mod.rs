//! Broker connection management
//!
//! Owns the single MQTT client connection the bridge runs over: connect
//! and handshake, subscribe to every route origin, the steady-state packet
//! loop, keep-alive, and reconnection with bounded exponential backoff.
//! Everything else in the process talks to the connection through the
//! command channel.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::metrics::Metrics;
use crate::protocol::{ConnectReturnCode, QoS};

mod manager;

#[cfg(test)]
mod tests;

pub use manager::ConnectionManager;

/// Message to send to the connection task
#[derive(Debug)]
pub enum Command {
    /// Publish a message to the broker
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        /// Resolved when the broker acknowledges the publish. Dropped
        /// unresolved if the connection is lost first.
        ack: oneshot::Sender<()>,
    },
    /// Disconnect cleanly and stop
    Shutdown,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Numeric encoding used by the connection state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Shared, observable view of the connection state.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<RwLock<ConnectionState>>,
    metrics: Arc<Metrics>,
}

impl StateHandle {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.set_connection_state(ConnectionState::Disconnected.as_gauge());
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            metrics,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
        self.metrics.set_connection_state(state.as_gauge());
    }
}

/// Connection task errors
#[derive(Debug)]
pub enum ConnectionError {
    /// TCP-level failure
    Io(std::io::Error),
    /// The broker closed the connection or the stream ended
    ConnectionLost(String),
    /// Connect or handshake step did not complete in time
    Timeout,
    /// The broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// The broker refused one of the origin subscriptions
    SubscriptionRefused(String),
    /// No PINGRESP arrived within the keep-alive window
    KeepAliveTimeout,
    /// Unexpected or malformed traffic
    Protocol(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            ConnectionError::Timeout => write!(f, "operation timed out"),
            ConnectionError::Rejected(code) => write!(f, "broker refused connection: {}", code),
            ConnectionError::SubscriptionRefused(filter) => {
                write!(f, "broker refused subscription to '{}'", filter)
            }
            ConnectionError::KeepAliveTimeout => write!(f, "keep-alive response missing"),
            ConnectionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}
