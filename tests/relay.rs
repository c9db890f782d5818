//! Relay integration tests
//!
//! Each test runs the full bridge wiring against a scripted broker: a bare
//! TcpListener that speaks just enough MQTT v3.1.1 to drive the scenario.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use relaymq::codec::{Decoder, Encoder};
use relaymq::config::Config;
use relaymq::connection::{Command, ConnectionManager, ConnectionState, StateHandle};
use relaymq::metrics::Metrics;
use relaymq::protocol::{ConnAck, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck};
use relaymq::relay::{PublishDispatcher, RelayEngine};
use relaymq::routing::RoutingTable;

/// One accepted connection on the scripted broker side.
struct BrokerSession {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl BrokerSession {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for bridge to connect")
            .expect("accept failed");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        self.encoder.encode(packet, &mut out).expect("encode failed");
        self.stream.write_all(&out).await.expect("write failed");
    }

    async fn recv(&mut self) -> Packet {
        timeout(Duration::from_secs(5), self.recv_inner())
            .await
            .expect("timed out waiting for packet")
    }

    async fn recv_inner(&mut self) -> Packet {
        loop {
            if let Some((packet, consumed)) =
                self.decoder.decode(&self.buf[..]).expect("decode failed")
            {
                self.buf.advance(consumed);
                return packet;
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("read failed");
            assert!(n > 0, "bridge closed the connection unexpectedly");
        }
    }

    /// True if no packet arrives within the window.
    async fn quiet_for(&mut self, window: Duration) -> bool {
        timeout(window, self.recv_inner()).await.is_err()
    }

    /// Accept the CONNECT and the origin SUBSCRIBE, granting everything.
    /// Returns the subscribed filters in request order.
    async fn handshake(&mut self) -> Vec<String> {
        let connect = match self.recv().await {
            Packet::Connect(c) => c,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        assert!(!connect.client_id.is_empty());

        self.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;

        let subscribe = match self.recv().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        let granted = vec![QoS::AtLeastOnce as u8; subscribe.subscriptions.len()];
        self.send(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: granted,
        }))
        .await;

        subscribe
            .subscriptions
            .into_iter()
            .map(|s| s.filter)
            .collect()
    }

    /// Deliver a QoS 1 PUBLISH to the bridge.
    async fn publish_qos1(&mut self, topic: &str, payload: &[u8], packet_id: u16) {
        self.send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
    }
}

/// A fully wired bridge pointed at the scripted broker.
struct Bridge {
    command_tx: mpsc::Sender<Command>,
    metrics: Arc<Metrics>,
    state: StateHandle,
    task: JoinHandle<()>,
}

fn test_config(addr: SocketAddr, extra: &str) -> Config {
    Config::parse(&format!(
        r#"
[broker]
address = "{addr}"
client_id = "bridge-under-test"
keepalive = 60
reconnect_interval = 1
max_reconnect_interval = 2
auth_retry_limit = 2

[topics]
app_subscribe = "a/sub"
app_publish = "a/pub"
embedded_subscribe = "e/sub"
embedded_publish = "e/pub"

{extra}
"#
    ))
    .expect("test config must parse")
}

fn start_bridge(config: Config) -> Bridge {
    let metrics = Arc::new(Metrics::new());
    let routes = RoutingTable::build(&config.routes(), config.topics.case_insensitive)
        .expect("routes must build");

    let (command_tx, command_rx) = mpsc::channel(config.relay.command_queue_capacity);
    let dispatcher = Arc::new(PublishDispatcher::new(
        command_tx.clone(),
        config.relay.max_inflight_publishes,
        config.relay.publish_timeout,
        QoS::AtLeastOnce,
        metrics.clone(),
    ));
    let engine = Arc::new(RelayEngine::new(routes, dispatcher, metrics.clone()));
    let manager = ConnectionManager::new(&config, engine, metrics.clone());
    let state = manager.state();

    let task = tokio::spawn(manager.run(command_rx));

    Bridge {
        command_tx,
        metrics,
        state,
        task,
    }
}

async fn scripted_broker() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    (listener, addr)
}

#[tokio::test]
async fn test_app_to_embedded_relay() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));
    let mut session = BrokerSession::accept(&listener).await;

    let filters = session.handshake().await;
    assert_eq!(filters, vec!["a/pub".to_string(), "e/pub".to_string()]);

    let payload = b"\x00\x01hello\xff\xfe";
    session.publish_qos1("a/pub", payload, 7).await;

    // The bridge acknowledges the inbound delivery and re-publishes
    let mut got_puback = false;
    let mut relayed: Option<Publish> = None;
    for _ in 0..2 {
        match session.recv().await {
            Packet::PubAck(ack) => {
                assert_eq!(ack.packet_id, 7);
                got_puback = true;
            }
            Packet::Publish(publish) => relayed = Some(publish),
            other => panic!("unexpected packet: {:?}", other),
        }
    }
    assert!(got_puback);

    let relayed = relayed.expect("no re-publish seen");
    assert_eq!(relayed.topic, "e/sub");
    assert_eq!(relayed.qos, QoS::AtLeastOnce);
    assert_eq!(&relayed.payload[..], payload);

    let packet_id = relayed.packet_id.expect("QoS 1 publish needs a packet id");
    session
        .send(&Packet::PubAck(PubAck { packet_id }))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.metrics.messages_received_total.get(), 1);
    assert_eq!(bridge.metrics.messages_relayed_total.get(), 1);
    assert_eq!(bridge.state.get(), ConnectionState::Connected);

    bridge.task.abort();
}

#[tokio::test]
async fn test_embedded_to_app_relay() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));
    let mut session = BrokerSession::accept(&listener).await;
    session.handshake().await;

    session.publish_qos1("e/pub", b"upstream", 11).await;

    let mut relayed = None;
    for _ in 0..2 {
        if let Packet::Publish(publish) = session.recv().await {
            relayed = Some(publish);
        }
    }
    let relayed = relayed.expect("no re-publish seen");
    assert_eq!(relayed.topic, "a/sub");
    assert_eq!(&relayed.payload[..], b"upstream");

    bridge.task.abort();
}

#[tokio::test]
async fn test_unroutable_message_acked_and_dropped() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));
    let mut session = BrokerSession::accept(&listener).await;
    session.handshake().await;

    session.publish_qos1("some/other/topic", b"stray", 3).await;

    // Still acknowledged at the MQTT level
    match session.recv().await {
        Packet::PubAck(ack) => assert_eq!(ack.packet_id, 3),
        other => panic!("unexpected packet: {:?}", other),
    }

    // But never re-published anywhere
    assert!(session.quiet_for(Duration::from_millis(300)).await);
    assert_eq!(bridge.metrics.messages_unroutable_total.get(), 1);
    assert_eq!(bridge.metrics.messages_relayed_total.get(), 0);

    bridge.task.abort();
}

#[tokio::test]
async fn test_qos0_inbound_not_acknowledged() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));
    let mut session = BrokerSession::accept(&listener).await;
    session.handshake().await;

    session
        .send(&Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            topic: "a/pub".to_string(),
            payload: Bytes::from_static(b"fire-and-forget"),
            ..Default::default()
        }))
        .await;

    // Only the re-publish comes back, no PUBACK
    match session.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "e/sub");
            assert_eq!(&publish.payload[..], b"fire-and-forget");
        }
        other => panic!("unexpected packet: {:?}", other),
    }

    bridge.task.abort();
}

#[tokio::test]
async fn test_reconnect_resubscribes_origins() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));

    let mut first = BrokerSession::accept(&listener).await;
    first.handshake().await;
    drop(first);

    // The bridge comes back on its own and subscribes again
    let mut second = BrokerSession::accept(&listener).await;
    let filters = second.handshake().await;
    assert_eq!(filters, vec!["a/pub".to_string(), "e/pub".to_string()]);

    second.publish_qos1("a/pub", b"after-reconnect", 21).await;
    let mut relayed = None;
    for _ in 0..2 {
        if let Packet::Publish(publish) = second.recv().await {
            relayed = Some(publish);
        }
    }
    assert_eq!(relayed.expect("no re-publish seen").topic, "e/sub");

    assert!(bridge.metrics.reconnects_total.get() >= 1);
    assert_eq!(bridge.state.get(), ConnectionState::Connected);

    bridge.task.abort();
}

#[tokio::test]
async fn test_unacknowledged_publish_times_out_without_blocking_intake() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(
        addr,
        "[relay]\npublish_timeout = \"200ms\"\n",
    ));
    let mut session = BrokerSession::accept(&listener).await;
    session.handshake().await;

    session.publish_qos1("a/pub", b"first", 1).await;
    // Swallow the PUBACK and the re-publish, never acknowledge the latter
    for _ in 0..2 {
        session.recv().await;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        bridge
            .metrics
            .publish_failures_total
            .with_label_values(&["timeout"])
            .get(),
        1
    );
    assert_eq!(bridge.metrics.messages_relayed_total.get(), 0);

    // Intake keeps flowing after the failure
    session.publish_qos1("a/pub", b"second", 2).await;
    let mut relayed = None;
    for _ in 0..2 {
        if let Packet::Publish(publish) = session.recv().await {
            relayed = Some(publish);
        }
    }
    assert_eq!(&relayed.expect("no re-publish seen").payload[..], b"second");

    bridge.task.abort();
}

#[tokio::test]
async fn test_clean_shutdown_sends_disconnect() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));
    let mut session = BrokerSession::accept(&listener).await;
    session.handshake().await;

    bridge
        .command_tx
        .send(Command::Shutdown)
        .await
        .expect("command channel closed");

    match session.recv().await {
        Packet::Disconnect => {}
        other => panic!("expected DISCONNECT, got {:?}", other),
    }

    timeout(Duration::from_secs(5), bridge.task)
        .await
        .expect("connection task did not stop")
        .expect("connection task panicked");
    assert_eq!(bridge.state.get(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_repeated_refusal_gives_up() {
    let (listener, addr) = scripted_broker().await;
    let bridge = start_bridge(test_config(addr, ""));

    // auth_retry_limit is 2: refuse both attempts
    for _ in 0..2 {
        let mut session = BrokerSession::accept(&listener).await;
        match session.recv().await {
            Packet::Connect(_) => {}
            other => panic!("expected CONNECT, got {:?}", other),
        }
        session
            .send(&Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::BadUsernamePassword,
            }))
            .await;
    }

    timeout(Duration::from_secs(10), bridge.task)
        .await
        .expect("connection task did not give up")
        .expect("connection task panicked");
    assert_eq!(bridge.state.get(), ConnectionState::Disconnected);
}
