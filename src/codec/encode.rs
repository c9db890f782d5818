//! MQTT v3.1.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, EncodeError, Packet, PubAck, Publish, QoS, Subscribe, Unsubscribe, PROTOCOL_LEVEL,
};

/// MQTT v3.1.1 packet encoder
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => {
                buf.put_u8(0x20); // CONNACK type + flags
                buf.put_u8(0x02);
                buf.put_u8(if p.session_present { 0x01 } else { 0x00 });
                buf.put_u8(p.return_code as u8);
                Ok(())
            }
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_puback(p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => {
                let remaining_length = 2 + p.return_codes.len();
                buf.put_u8(0x90); // SUBACK type
                write_variable_int(buf, remaining_length as u32)?;
                buf.put_u16(p.packet_id);
                for code in &p.return_codes {
                    buf.put_u8(*code);
                }
                Ok(())
            }
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => {
                buf.put_u8(0xB0); // UNSUBACK type
                buf.put_u8(0x02);
                buf.put_u16(p.packet_id);
                Ok(())
            }
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0); // DISCONNECT type + flags
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Variable header: protocol name + level + flags + keep alive
        let mut remaining_length = 6 + 1 + 1 + 2;

        // Client ID
        remaining_length += 2 + packet.client_id.len();

        // Username
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }

        // Password
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        // Fixed header
        buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
        write_variable_int(buf, remaining_length as u32)?;

        // Protocol name and level
        write_string(buf, "MQTT")?;
        buf.put_u8(PROTOCOL_LEVEL);

        // Connect flags
        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        // Keep alive
        buf.put_u16(packet.keep_alive);

        // Client ID
        write_string(buf, &packet.client_id)?;

        // Username
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }

        // Password
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Topic length prefix + topic
        let mut remaining_length = 2 + packet.topic.len();

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2; // packet identifier
        }

        remaining_length += packet.payload.len();

        // Fixed header
        let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        // Topic name
        write_string(buf, &packet.topic)?;

        // Packet identifier (only for QoS > 0)
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        // Payload
        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_puback(&self, packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x40); // PUBACK type
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2; // packet identifier

        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1; // string + QoS byte
        }

        // Fixed header
        buf.put_u8(0x82); // SUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        // Subscriptions
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining_length = 2; // packet identifier

        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        // Fixed header
        buf.put_u8(0xA2); // UNSUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        // Topic filters
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }
}
