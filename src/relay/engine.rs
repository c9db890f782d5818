use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::routing::RoutingTable;

use super::dispatcher::Dispatch;

/// A message delivered on one of the subscribed origin topics.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Payload, passed through byte for byte
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A route matched and the publish was handed to the dispatcher
    Relayed { destination: String },
    /// No route matched the topic; the message was dropped
    Unroutable,
    /// A route matched but the dispatcher refused the publish
    Rejected(super::DispatchError),
}

/// Routes inbound messages to their destination topic.
///
/// Holds no per-message state. Completion of the outbound publish is
/// tracked asynchronously by the dispatcher, so a slow destination never
/// blocks intake of the next message.
pub struct RelayEngine {
    routes: RoutingTable,
    dispatcher: Arc<dyn Dispatch>,
    metrics: Arc<Metrics>,
}

impl RelayEngine {
    pub fn new(routes: RoutingTable, dispatcher: Arc<dyn Dispatch>, metrics: Arc<Metrics>) -> Self {
        Self {
            routes,
            dispatcher,
            metrics,
        }
    }

    /// The routing table backing this engine.
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Process one inbound message.
    pub async fn handle(&self, message: InboundMessage) -> Outcome {
        self.metrics.message_received();

        let destination = match self.routes.resolve(&message.topic) {
            Some(destination) => destination.to_string(),
            None => {
                debug!("No route for topic '{}', dropping message", message.topic);
                self.metrics.message_unroutable();
                return Outcome::Unroutable;
            }
        };

        debug!(
            "Relaying {} bytes: {} -> {}",
            message.payload.len(),
            message.topic,
            destination
        );

        match self
            .dispatcher
            .dispatch(destination.clone(), message.payload)
            .await
        {
            Ok(()) => Outcome::Relayed { destination },
            Err(e) => {
                warn!(
                    "Publish to '{}' rejected before send: {}",
                    destination, e
                );
                self.metrics.publish_failed(e.reason());
                Outcome::Rejected(e)
            }
        }
    }
}
