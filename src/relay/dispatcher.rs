use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::connection::Command;
use crate::metrics::Metrics;
use crate::protocol::QoS;

/// Why a publish was refused at hand-off time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The in-flight limit or the command queue is full
    QueueFull,
    /// The connection task has gone away
    Closed,
}

impl DispatchError {
    /// Label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::QueueFull => "queue_full",
            DispatchError::Closed => "closed",
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::QueueFull => write!(f, "publish queue full"),
            DispatchError::Closed => write!(f, "connection task closed"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Hand-off point between the relay engine and the broker connection.
///
/// `dispatch` returns once the publish is accepted for delivery, not once
/// it is acknowledged. Acknowledgement is awaited by a spawned watcher so
/// the caller can move on to the next message.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, topic: String, payload: Bytes) -> Result<(), DispatchError>;
}

/// Dispatcher that forwards publishes to the connection task and tracks
/// each one against a completion timeout.
pub struct PublishDispatcher {
    command_tx: mpsc::Sender<Command>,
    /// Bounds the number of publishes awaiting acknowledgement
    inflight: Arc<Semaphore>,
    publish_timeout: Duration,
    qos: QoS,
    metrics: Arc<Metrics>,
}

impl PublishDispatcher {
    pub fn new(
        command_tx: mpsc::Sender<Command>,
        max_inflight: usize,
        publish_timeout: Duration,
        qos: QoS,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            command_tx,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            publish_timeout,
            qos,
            metrics,
        }
    }
}

#[async_trait]
impl Dispatch for PublishDispatcher {
    async fn dispatch(&self, topic: String, payload: Bytes) -> Result<(), DispatchError> {
        // Refuse rather than wait when the in-flight window is exhausted;
        // intake must stay responsive under a slow or absent broker.
        let permit = match self.inflight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::NoPermits) => return Err(DispatchError::QueueFull),
            Err(tokio::sync::TryAcquireError::Closed) => return Err(DispatchError::Closed),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let bytes = payload.len();

        let command = Command::Publish {
            topic: topic.clone(),
            payload,
            qos: self.qos,
            ack: ack_tx,
        };

        match self.command_tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(DispatchError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(DispatchError::Closed),
        }

        let publish_timeout = self.publish_timeout;
        let metrics = self.metrics.clone();
        metrics.publish_started();

        // Watch for the acknowledgement off the intake path. The permit is
        // held until the publish resolves one way or the other.
        tokio::spawn(async move {
            let start = Instant::now();
            match timeout(publish_timeout, ack_rx).await {
                Ok(Ok(())) => {
                    debug!("Publish to '{}' acknowledged ({} bytes)", topic, bytes);
                    metrics.message_relayed(bytes, start.elapsed().as_secs_f64());
                }
                Ok(Err(_)) => {
                    // Connection dropped before the PUBACK arrived
                    warn!(
                        "Publish to '{}' failed: connection lost before acknowledgement",
                        topic
                    );
                    metrics.publish_failed("connection_lost");
                }
                Err(_) => {
                    warn!(
                        "Publish to '{}' not acknowledged within {:?}, giving up",
                        topic, publish_timeout
                    );
                    metrics.publish_failed("timeout");
                }
            }
            metrics.publish_finished();
            drop(permit);
        });

        Ok(())
    }
}
