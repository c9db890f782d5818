//! MQTT v3.1.1 protocol definitions
//!
//! Covers the client-side packet subset a relay bridge needs. QoS 2 and the
//! v5.0 property machinery are deliberately absent: the bridge subscribes and
//! publishes at QoS 0/1 only.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError};
pub use packet::*;

/// Protocol level byte carried in CONNECT for MQTT v3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Quality of Service levels supported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

/// CONNACK return codes (MQTT v3.1.1, table 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadUsernamePassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    /// Whether reconnecting with the same parameters can possibly succeed.
    ///
    /// Only `ServerUnavailable` is a broker-side condition; every other
    /// refusal is about the credentials or parameters we would resend
    /// unchanged, so it counts against the bounded auth retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectReturnCode::ServerUnavailable)
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => write!(f, "identifier rejected"),
            ConnectReturnCode::ServerUnavailable => write!(f, "server unavailable"),
            ConnectReturnCode::BadUsernamePassword => write!(f, "bad user name or password"),
            ConnectReturnCode::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

/// MQTT packet type codes (fixed header high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}
