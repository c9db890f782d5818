//! MQTT v3.1.1 packet decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, SubAck,
    Subscribe, Subscription, Unsubscribe, UnsubAck, PROTOCOL_LEVEL,
};

/// Incremental MQTT v3.1.1 packet decoder
///
/// `decode` returns `Ok(None)` until a complete packet is buffered, so the
/// caller can feed it partial reads straight off the socket.
#[derive(Debug)]
pub struct Decoder {
    /// Maximum accepted packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed) or error
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Check packet size limit
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload_start = 1 + len_bytes;
        let payload = &buf[payload_start..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => {
                check_flags(flags, 0)?;
                Packet::PubAck(PubAck {
                    packet_id: read_packet_id(payload)?,
                })
            }
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => {
                check_flags(flags, 0)?;
                Packet::UnsubAck(UnsubAck {
                    packet_id: read_packet_id(payload)?,
                })
            }
            12 => {
                check_flags(flags, 0)?;
                Packet::PingReq
            }
            13 => {
                check_flags(flags, 0)?;
                Packet::PingResp
            }
            14 => {
                check_flags(flags, 0)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        check_flags(flags, 0)?;
        let mut pos = 0;

        // Protocol name
        let (protocol_name, len) = read_string(&payload[pos..])?;
        pos += len;

        if protocol_name != "MQTT" {
            return Err(DecodeError::MalformedPacket("invalid protocol name"));
        }

        // Protocol level
        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        if payload[pos] != PROTOCOL_LEVEL {
            return Err(DecodeError::MalformedPacket("unsupported protocol level"));
        }
        pos += 1;

        // Connect flags
        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = payload[pos];
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // The bridge never sets a will, and the scripted test brokers built
        // on this decoder never need to accept one.
        if will_flag {
            return Err(DecodeError::MalformedPacket("will message not supported"));
        }

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        // Keep alive
        if pos + 2 > payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;

        // Client ID
        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        // Username
        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        // Password
        let password = if password_flag {
            let (data, _len) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        check_flags(flags, 0)?;

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        // Only bit 0 (session present) is valid in the acknowledge flags
        if (payload[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let session_present = (payload[0] & 0x01) != 0;

        let return_code =
            ConnectReturnCode::from_u8(payload[1]).ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let mut pos = 0;

        // Topic name
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        // Packet identifier (QoS 1 only)
        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_packet_id(&payload[pos..])?;
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        check_flags(flags, 0x02)?;

        let packet_id = read_packet_id(payload)?;
        let mut pos = 2;

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if pos >= payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let qos = QoS::from_u8(payload[pos]).ok_or(DecodeError::InvalidQoS(payload[pos]))?;
            pos += 1;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket("subscribe without filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        check_flags(flags, 0)?;

        let packet_id = read_packet_id(payload)?;
        let return_codes = payload[2..].to_vec();

        if return_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("suback without return codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        check_flags(flags, 0x02)?;

        let packet_id = read_packet_id(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("unsubscribe without filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

fn read_packet_id(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}
