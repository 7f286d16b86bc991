//! MQTT 3.1 control packets spoken over the edge chat WebSocket.
//!
//! The edge endpoint expects the legacy `MQIsdp` protocol name at level 3.
//! Only the packets a client profile needs are modelled; anything else is
//! rejected by the decoder.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{put_remaining_length, put_string, remaining_length_size};
use crate::WireError;

/// Protocol name sent in CONNECT
pub const PROTOCOL_NAME: &str = "MQIsdp";
/// Protocol level sent in CONNECT
pub const PROTOCOL_LEVEL: u8 = 3;
/// Client identifier used by the web client profile
pub const CLIENT_ID: &str = "mqttwsclient";

/// Control packet type nibble
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client request to connect
    Connect = 1,
    /// Connect acknowledgment
    ConnAck = 2,
    /// Publish message
    Publish = 3,
    /// Publish acknowledgment (QoS 1)
    PubAck = 4,
    /// Subscribe request
    Subscribe = 8,
    /// Subscribe acknowledgment
    SubAck = 9,
    /// Unsubscribe request
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment
    UnsubAck = 11,
    /// Ping request
    PingReq = 12,
    /// Ping response
    PingResp = 13,
    /// Client is disconnecting
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            other => Err(WireError::Type(other)),
        }
    }
}

bitflags! {
    /// CONNECT flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectFlags: u8 {
        /// Username present in payload
        const USERNAME = 0x80;
        /// Password present in payload
        const PASSWORD = 0x40;
        /// Will message is retained
        const WILL_RETAIN = 0x20;
        /// Will QoS bits
        const WILL_QOS = 0x18;
        /// Will message present
        const WILL = 0x04;
        /// Discard any previous session state
        const CLEAN_SESSION = 0x02;
    }
}

/// Delivery guarantee for a publish
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce = 0,
    /// Acknowledged with PUBACK
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(WireError::Qos(other)),
        }
    }
}

/// CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier
    pub client_id: String,
    /// Keepalive in seconds
    pub keepalive: u16,
    /// Start from a clean session
    pub clean_session: bool,
    /// JSON-encoded session descriptor carried in the username field
    pub username: Option<String>,
}

impl Connect {
    /// Build the connect packet used by the web client profile
    pub fn web_client(username: String, keepalive: u16) -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            keepalive,
            clean_session: true,
            username: Some(username),
        }
    }

    fn flags(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        if self.clean_session {
            flags |= ConnectFlags::CLEAN_SESSION;
        }
        if self.username.is_some() {
            flags |= ConnectFlags::USERNAME;
        }
        flags
    }
}

/// CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Server kept state from a previous session
    pub session_present: bool,
    /// Connect return code (0 = accepted)
    pub code: u8,
}

impl ConnAck {
    /// Whether the server accepted the connection
    pub fn is_accepted(&self) -> bool {
        self.code == 0
    }

    /// Human readable refusal reason for a non-zero return code
    pub fn refusal_reason(&self) -> Option<&'static str> {
        match self.code {
            0 => None,
            1 => Some("Connection refused: Unacceptable protocol version"),
            2 => Some("Connection refused: Identifier rejected"),
            3 => Some("Connection refused: Server unavailable"),
            4 => Some("Connection refused: Bad username or password"),
            5 => Some("Connection refused: Not authorized"),
            _ => Some("Connection refused: Unknown return code"),
        }
    }
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name
    pub topic: String,
    /// Delivery guarantee
    pub qos: QoS,
    /// Packet identifier, present when qos > 0
    pub packet_id: Option<u16>,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Application payload
    pub payload: Bytes,
}

impl Publish {
    /// QoS 1 publish with the given packet id
    pub fn at_least_once(topic: &str, packet_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_string(),
            qos: QoS::AtLeastOnce,
            packet_id: Some(packet_id),
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }

    /// QoS 0 publish
    pub fn at_most_once(topic: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Requested topic filters with their maximum QoS
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier of the acknowledged SUBSCRIBE
    pub packet_id: u16,
    /// Granted QoS per topic (0x80 = failure)
    pub return_codes: Vec<u8>,
}

/// A decoded or to-be-encoded control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT
    Connect(Connect),
    /// CONNACK
    ConnAck(ConnAck),
    /// PUBLISH
    Publish(Publish),
    /// PUBACK
    PubAck {
        /// Acknowledged packet id
        packet_id: u16,
    },
    /// SUBSCRIBE
    Subscribe(Subscribe),
    /// SUBACK
    SubAck(SubAck),
    /// UNSUBACK
    UnsubAck {
        /// Acknowledged packet id
        packet_id: u16,
    },
    /// PINGREQ
    PingReq,
    /// PINGRESP
    PingResp,
    /// DISCONNECT
    Disconnect,
}

impl Packet {
    /// Packet type of this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck { .. } => PacketType::PubAck,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::UnsubAck { .. } => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Encode the packet into a contiguous buffer
    pub fn encode(&self, max_packet_size: usize) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        let fixed_flags: u8 = match self {
            Packet::Connect(connect) => {
                put_string(&mut body, PROTOCOL_NAME);
                body.put_u8(PROTOCOL_LEVEL);
                body.put_u8(connect.flags().bits());
                body.put_u16(connect.keepalive);
                put_string(&mut body, &connect.client_id);
                if let Some(ref username) = connect.username {
                    put_string(&mut body, username);
                }
                0
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.code);
                0
            }
            Packet::Publish(publish) => {
                put_string(&mut body, &publish.topic);
                if publish.qos != QoS::AtMostOnce {
                    let packet_id = publish.packet_id.ok_or(WireError::Malformed)?;
                    body.put_u16(packet_id);
                }
                body.put_slice(&publish.payload);

                let mut flags = (publish.qos as u8) << 1;
                if publish.dup {
                    flags |= 0x08;
                }
                if publish.retain {
                    flags |= 0x01;
                }
                flags
            }
            Packet::PubAck { packet_id } | Packet::UnsubAck { packet_id } => {
                body.put_u16(*packet_id);
                0
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.packet_id);
                for (topic, qos) in &subscribe.topics {
                    put_string(&mut body, topic);
                    body.put_u8(*qos as u8);
                }
                // SUBSCRIBE carries the mandatory 0b0010 reserved flags
                0x02
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.packet_id);
                body.put_slice(&ack.return_codes);
                0
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };

        let total = 1 + remaining_length_size(body.len()) + body.len();
        if total > max_packet_size {
            return Err(WireError::Size(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(((self.packet_type() as u8) << 4) | fixed_flags);
        put_remaining_length(&mut buf, body.len())?;
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pingreq_encoding() {
        let bytes = Packet::PingReq.encode(16).unwrap();
        assert_eq!(bytes.as_ref(), &[0xC0, 0x00]);
    }

    #[test]
    fn test_connect_header_bytes() {
        let connect = Connect::web_client("{\"u\":\"1\"}".to_string(), 30);
        let bytes = Packet::Connect(connect).encode(1024).unwrap();

        assert_eq!(bytes[0], 0x10);
        // Protocol name length + "MQIsdp"
        assert_eq!(&bytes[2..10], &[0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p']);
        assert_eq!(bytes[10], PROTOCOL_LEVEL);
        assert_eq!(bytes[11], (ConnectFlags::USERNAME | ConnectFlags::CLEAN_SESSION).bits());
        assert_eq!(u16::from_be_bytes([bytes[12], bytes[13]]), 30);
    }

    #[test]
    fn test_publish_qos1_requires_packet_id() {
        let mut publish = Publish::at_least_once("/t_ms", 1, Bytes::from_static(b"{}"));
        publish.packet_id = None;
        assert!(matches!(
            Packet::Publish(publish).encode(1024),
            Err(WireError::Malformed)
        ));
    }

    #[test]
    fn test_connack_refusal_reason() {
        let ack = ConnAck { session_present: false, code: 3 };
        assert!(!ack.is_accepted());
        assert_eq!(
            ack.refusal_reason(),
            Some("Connection refused: Server unavailable")
        );
        assert_eq!(ConnAck { session_present: false, code: 0 }.refusal_reason(), None);
    }

    #[test]
    fn test_size_limit() {
        let publish = Publish::at_most_once("/t_ms", vec![0u8; 512]);
        assert!(matches!(
            Packet::Publish(publish).encode(64),
            Err(WireError::Size(_))
        ));
    }
}
