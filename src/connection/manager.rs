use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::{BrokerConfig, Config};
use crate::metrics::Metrics;
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, Subscribe, Subscription,
};
use crate::relay::{InboundMessage, RelayEngine};

use super::{Command, ConnectionError, ConnectionState, StateHandle};

/// Packet identifier allocator.
///
/// Identifiers are reused once acknowledged; an identifier still awaiting
/// its PUBACK is skipped. Zero is never a valid identifier.
pub(super) struct PacketIds {
    next: u16,
}

impl PacketIds {
    pub(super) fn new() -> Self {
        Self { next: 1 }
    }

    pub(super) fn allocate(&mut self, pending: &HashMap<u16, oneshot::Sender<()>>) -> u16 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Double the retry interval, capped.
pub(super) fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Apply +-20% jitter so a fleet of bridges does not reconnect in lockstep.
pub(super) fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

/// Owns the connection to the broker and runs it to completion.
///
/// Created once at startup and consumed by `run`, which only returns on
/// clean shutdown or when the broker keeps refusing the credentials.
pub struct ConnectionManager {
    config: BrokerConfig,
    subscribe_qos: QoS,
    shutdown_grace: Duration,
    engine: Arc<RelayEngine>,
    state: StateHandle,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    pub fn new(config: &Config, engine: Arc<RelayEngine>, metrics: Arc<Metrics>) -> Self {
        // qos is validated to 0 or 1 at config load
        let subscribe_qos = QoS::from_u8(config.topics.qos).unwrap_or(QoS::AtLeastOnce);

        Self {
            config: config.broker.clone(),
            subscribe_qos,
            shutdown_grace: config.relay.shutdown_grace,
            engine,
            state: StateHandle::new(metrics.clone()),
            metrics,
        }
    }

    /// Observable handle to the connection state.
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Run the connection until shutdown.
    ///
    /// Reconnects forever on transient failures. Gives up only when the
    /// broker refuses the CONNECT with a non-retryable return code
    /// `auth_retry_limit` times in a row.
    pub async fn run(self, mut command_rx: mpsc::Receiver<Command>) {
        let base = self.config.reconnect_interval_duration();
        let max = self.config.max_reconnect_interval_duration();
        let mut retry_interval = base;
        let mut refusals = 0u32;
        let mut first_attempt = true;

        loop {
            if first_attempt {
                self.state.set(ConnectionState::Connecting);
            } else {
                self.state.set(ConnectionState::Reconnecting);
                self.metrics.reconnect_attempt();
            }
            debug!("Connecting to broker at {}", self.config.address);

            match self.connect_and_run(&mut command_rx).await {
                Ok(()) => {
                    info!("Disconnected from broker cleanly");
                    self.state.set(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    // A session that reached the connected state resets
                    // the backoff schedule and the refusal count.
                    if self.state.get() == ConnectionState::Connected {
                        retry_interval = base;
                        refusals = 0;
                    }

                    match &e {
                        ConnectionError::Rejected(code) if !code.is_retryable() => {
                            refusals += 1;
                            error!(
                                "Broker refused connection ({}), attempt {}/{}",
                                code, refusals, self.config.auth_retry_limit
                            );
                            if refusals >= self.config.auth_retry_limit {
                                error!("Giving up after {} refused connection attempts", refusals);
                                self.state.set(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        _ => warn!("Connection failed: {}", e),
                    }
                }
            }

            first_attempt = false;
            self.state.set(ConnectionState::Reconnecting);

            let delay = jittered(retry_interval);
            debug!("Reconnecting in {:?}", delay);
            if wait_backoff(&mut command_rx, delay).await {
                info!("Shutdown requested during reconnect backoff");
                self.state.set(ConnectionState::Disconnected);
                return;
            }
            retry_interval = next_backoff(retry_interval, max);
        }
    }

    /// Connect, handshake, subscribe, then run the packet loop.
    async fn connect_and_run(
        &self,
        command_rx: &mut mpsc::Receiver<Command>,
    ) -> Result<(), ConnectionError> {
        let (host, port) = self.config.parse_address();
        let connect_timeout = self.config.connect_timeout_duration();

        let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::ConnectionLost(e.to_string()))?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}:{}", host, port);

        let encoder = Encoder::new();
        let decoder = Decoder::new();
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let mut write_buf = BytesMut::with_capacity(8 * 1024);

        // CONNECT / CONNACK
        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.config.client_id.clone(),
            clean_session: self.config.clean_session,
            keep_alive: self.config.keepalive,
            username: self.config.username.clone(),
            password: self
                .config
                .password
                .as_ref()
                .map(|p| Bytes::copy_from_slice(p.as_bytes())),
        }));
        send_packet(&encoder, &mut write_half, &mut write_buf, &connect).await?;

        let packet = timeout(
            connect_timeout,
            read_packet(&mut read_half, &decoder, &mut read_buf),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)??;

        match packet {
            Packet::ConnAck(ack) => match ack.return_code {
                ConnectReturnCode::Accepted => {
                    info!(
                        "Connected to broker at {} (session_present={})",
                        self.config.address, ack.session_present
                    );
                }
                code => return Err(ConnectionError::Rejected(code)),
            },
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other
                )))
            }
        }

        let mut packet_ids = PacketIds::new();
        let mut pending: HashMap<u16, oneshot::Sender<()>> = HashMap::new();

        // Subscribe to every origin topic in a single SUBSCRIBE before
        // declaring the connection usable.
        let sub_id = packet_ids.allocate(&pending);
        let subscriptions: Vec<Subscription> = self
            .engine
            .routes()
            .origins()
            .map(|origin| Subscription {
                filter: origin.to_string(),
                qos: self.subscribe_qos,
            })
            .collect();
        info!(
            "Subscribing to {} origin topics at QoS {}",
            subscriptions.len(),
            self.subscribe_qos as u8
        );
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: sub_id,
            subscriptions,
        });
        send_packet(&encoder, &mut write_half, &mut write_buf, &subscribe).await?;

        // The broker may deliver queued messages before the SUBACK when a
        // persistent session is resumed; handle them while waiting.
        timeout(connect_timeout, async {
            loop {
                let packet = read_packet(&mut read_half, &decoder, &mut read_buf).await?;
                match packet {
                    Packet::SubAck(ack) => {
                        if ack.packet_id != sub_id {
                            return Err(ConnectionError::Protocol(format!(
                                "SUBACK for unexpected packet id {}",
                                ack.packet_id
                            )));
                        }
                        for (code, origin) in
                            ack.return_codes.iter().zip(self.engine.routes().origins())
                        {
                            if *code == SubAck::FAILURE {
                                return Err(ConnectionError::SubscriptionRefused(
                                    origin.to_string(),
                                ));
                            }
                        }
                        return Ok(());
                    }
                    Packet::Publish(publish) => {
                        self.handle_inbound(publish, &mut write_half, &encoder, &mut write_buf)
                            .await?;
                    }
                    Packet::PingResp => {}
                    other => {
                        debug!("Ignoring {:?} while waiting for SUBACK", other);
                    }
                }
            }
        })
        .await
        .map_err(|_| ConnectionError::Timeout)??;

        self.state.set(ConnectionState::Connected);
        debug!("Subscriptions established, entering packet loop");

        // Steady state
        let keepalive_enabled = self.config.keepalive > 0;
        let mut keepalive_timer = tokio::time::interval(Duration::from_secs(
            u64::from(self.config.keepalive.max(1)),
        ));
        keepalive_timer.reset();
        let mut ping_outstanding = false;

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Publish { topic, payload, qos, ack }) => {
                        let packet_id = match qos {
                            QoS::AtMostOnce => None,
                            QoS::AtLeastOnce => Some(packet_ids.allocate(&pending)),
                        };
                        let publish = Packet::Publish(Publish {
                            dup: false,
                            qos,
                            retain: false,
                            topic,
                            packet_id,
                            payload,
                        });
                        send_packet(&encoder, &mut write_half, &mut write_buf, &publish).await?;
                        match packet_id {
                            Some(id) => {
                                pending.insert(id, ack);
                            }
                            None => {
                                // QoS 0 is complete once written
                                let _ = ack.send(());
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        return self
                            .drain_and_disconnect(
                                &mut read_half,
                                &mut write_half,
                                &encoder,
                                &decoder,
                                &mut read_buf,
                                &mut write_buf,
                                &mut pending,
                            )
                            .await;
                    }
                },

                result = read_half.read_buf(&mut read_buf) => {
                    let n = result.map_err(|e| ConnectionError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(ConnectionError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }

                    while let Some((packet, consumed)) = decoder
                        .decode(&read_buf[..])
                        .map_err(|e| ConnectionError::Protocol(format!("decode error: {}", e)))?
                    {
                        read_buf.advance(consumed);
                        match packet {
                            Packet::Publish(publish) => {
                                self.handle_inbound(
                                    publish,
                                    &mut write_half,
                                    &encoder,
                                    &mut write_buf,
                                )
                                .await?;
                            }
                            Packet::PubAck(ack) => {
                                match pending.remove(&ack.packet_id) {
                                    Some(tx) => {
                                        let _ = tx.send(());
                                    }
                                    None => {
                                        debug!("PUBACK for unknown packet id {}", ack.packet_id);
                                    }
                                }
                            }
                            Packet::PingResp => {
                                ping_outstanding = false;
                            }
                            Packet::SubAck(_) | Packet::UnsubAck(_) => {}
                            Packet::Disconnect => {
                                return Err(ConnectionError::ConnectionLost(
                                    "broker sent DISCONNECT".to_string(),
                                ));
                            }
                            other => {
                                debug!("Ignoring unexpected packet: {:?}", other);
                            }
                        }
                    }
                },

                _ = keepalive_timer.tick(), if keepalive_enabled => {
                    if ping_outstanding {
                        return Err(ConnectionError::KeepAliveTimeout);
                    }
                    send_packet(&encoder, &mut write_half, &mut write_buf, &Packet::PingReq)
                        .await?;
                    ping_outstanding = true;
                }
            }
        }
    }

    /// Relay an inbound PUBLISH and acknowledge it at QoS 1.
    ///
    /// The acknowledgement follows the hand-off to the dispatcher, so a
    /// message the bridge accepted but crashed on would be redelivered.
    async fn handle_inbound(
        &self,
        publish: Publish,
        write_half: &mut OwnedWriteHalf,
        encoder: &Encoder,
        write_buf: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        let qos = publish.qos;
        let packet_id = publish.packet_id;

        if publish.dup {
            debug!("Redelivered message on '{}'", publish.topic);
        }

        self.engine
            .handle(InboundMessage::new(publish.topic, publish.payload))
            .await;

        if qos == QoS::AtLeastOnce {
            if let Some(id) = packet_id {
                let puback = Packet::PubAck(PubAck { packet_id: id });
                send_packet(encoder, write_half, write_buf, &puback).await?;
            }
        }
        Ok(())
    }

    /// Give in-flight publishes a grace period, then DISCONNECT.
    #[allow(clippy::too_many_arguments)]
    async fn drain_and_disconnect(
        &self,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        encoder: &Encoder,
        decoder: &Decoder,
        read_buf: &mut BytesMut,
        write_buf: &mut BytesMut,
        pending: &mut HashMap<u16, oneshot::Sender<()>>,
    ) -> Result<(), ConnectionError> {
        info!(
            "Shutting down with {} publishes awaiting acknowledgement",
            pending.len()
        );

        let deadline = Instant::now() + self.shutdown_grace;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "{} publishes still unacknowledged at shutdown",
                    pending.len()
                );
                break;
            }

            match timeout(remaining, read_packet(read_half, decoder, read_buf)).await {
                Ok(Ok(Packet::PubAck(ack))) => {
                    if let Some(tx) = pending.remove(&ack.packet_id) {
                        let _ = tx.send(());
                    }
                }
                Ok(Ok(Packet::Publish(publish))) => {
                    if self
                        .handle_inbound(publish, write_half, encoder, write_buf)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Connection lost during shutdown drain: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(
                        "{} publishes still unacknowledged at shutdown",
                        pending.len()
                    );
                    break;
                }
            }
        }

        let _ = send_packet(encoder, write_half, write_buf, &Packet::Disconnect).await;
        Ok(())
    }
}

/// Sleep out the backoff delay while still honoring shutdown.
///
/// Publishes arriving while disconnected are dropped; their ack channels
/// report the failure. Returns true if shutdown was requested.
async fn wait_backoff(command_rx: &mut mpsc::Receiver<Command>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = command_rx.recv() => match cmd {
                Some(Command::Shutdown) | None => return true,
                Some(Command::Publish { topic, .. }) => {
                    debug!("Dropping publish to '{}' while disconnected", topic);
                }
            }
        }
    }
}

/// Encode and write one packet.
async fn send_packet(
    encoder: &Encoder,
    write_half: &mut OwnedWriteHalf,
    write_buf: &mut BytesMut,
    packet: &Packet,
) -> Result<(), ConnectionError> {
    write_buf.clear();
    encoder
        .encode(packet, write_buf)
        .map_err(|e| ConnectionError::Protocol(format!("encode error: {}", e)))?;
    write_half
        .write_all(write_buf)
        .await
        .map_err(|e| ConnectionError::ConnectionLost(e.to_string()))?;
    Ok(())
}

/// Read from the socket until one complete packet is decodable.
async fn read_packet(
    read_half: &mut OwnedReadHalf,
    decoder: &Decoder,
    read_buf: &mut BytesMut,
) -> Result<Packet, ConnectionError> {
    loop {
        if let Some((packet, consumed)) = decoder
            .decode(&read_buf[..])
            .map_err(|e| ConnectionError::Protocol(format!("decode error: {}", e)))?
        {
            read_buf.advance(consumed);
            return Ok(packet);
        }

        let n = read_half
            .read_buf(read_buf)
            .await
            .map_err(|e| ConnectionError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::ConnectionLost(
                "connection closed".to_string(),
            ));
        }
    }
}
