//! Prometheus metrics for relaymq
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Counts flow through the relay (received, relayed, unroutable, failed)
//! and connection health (state, reconnects).

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

mod server;

pub use server::MetricsServer;

/// All relaymq metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Flow metrics
    pub messages_received_total: IntCounter,
    pub messages_relayed_total: IntCounter,
    pub messages_unroutable_total: IntCounter,
    pub publish_failures_total: IntCounterVec,
    pub bytes_relayed_total: IntCounter,

    // Connection metrics
    pub connection_state: IntGauge,
    pub reconnects_total: IntCounter,

    // Performance metrics
    pub inflight_publishes: IntGauge,
    pub relay_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received_total = IntCounter::with_opts(Opts::new(
            "relaymq_messages_received_total",
            "Total PUBLISH messages received on origin topics",
        ))
        .unwrap();

        let messages_relayed_total = IntCounter::with_opts(Opts::new(
            "relaymq_messages_relayed_total",
            "Total messages re-published and acknowledged by the broker",
        ))
        .unwrap();

        let messages_unroutable_total = IntCounter::with_opts(Opts::new(
            "relaymq_messages_unroutable_total",
            "Total messages dropped because no route matched their topic",
        ))
        .unwrap();

        let publish_failures_total = IntCounterVec::new(
            Opts::new(
                "relaymq_publish_failures_total",
                "Total outbound publishes that failed, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let bytes_relayed_total = IntCounter::with_opts(Opts::new(
            "relaymq_bytes_relayed_total",
            "Total payload bytes relayed between peers",
        ))
        .unwrap();

        let connection_state = IntGauge::with_opts(Opts::new(
            "relaymq_connection_state",
            "Broker connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting)",
        ))
        .unwrap();

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "relaymq_reconnects_total",
            "Total reconnection attempts since startup",
        ))
        .unwrap();

        let inflight_publishes = IntGauge::with_opts(Opts::new(
            "relaymq_inflight_publishes",
            "Outbound publishes currently awaiting acknowledgement",
        ))
        .unwrap();

        let relay_latency = Histogram::with_opts(
            HistogramOpts::new(
                "relaymq_relay_latency_seconds",
                "Time from message intake to destination acknowledgement",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
        )
        .unwrap();

        registry
            .register(Box::new(messages_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_relayed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_unroutable_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bytes_relayed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_state.clone()))
            .unwrap();
        registry
            .register(Box::new(reconnects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(inflight_publishes.clone()))
            .unwrap();
        registry.register(Box::new(relay_latency.clone())).unwrap();

        Metrics {
            registry,
            messages_received_total,
            messages_relayed_total,
            messages_unroutable_total,
            publish_failures_total,
            bytes_relayed_total,
            connection_state,
            reconnects_total,
            inflight_publishes,
            relay_latency,
        }
    }

    // Helper methods for common operations

    pub fn message_received(&self) {
        self.messages_received_total.inc();
    }

    pub fn message_relayed(&self, bytes: usize, latency_secs: f64) {
        self.messages_relayed_total.inc();
        self.bytes_relayed_total.inc_by(bytes as u64);
        self.relay_latency.observe(latency_secs);
    }

    pub fn message_unroutable(&self) {
        self.messages_unroutable_total.inc();
    }

    pub fn publish_failed(&self, reason: &str) {
        self.publish_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn reconnect_attempt(&self) {
        self.reconnects_total.inc();
    }

    pub fn set_connection_state(&self, state: i64) {
        self.connection_state.set(state);
    }

    pub fn publish_started(&self) {
        self.inflight_publishes.inc();
    }

    pub fn publish_finished(&self) {
        self.inflight_publishes.dec();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
