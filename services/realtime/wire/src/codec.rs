//! Encoding helpers and the incremental packet decoder.
//!
//! WebSocket frames and MQTT packets do not line up: one binary frame may
//! carry several packets or only part of one. `PacketDecoder` keeps the
//! caller's buffer and yields packets as soon as they are complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packet::{
    ConnAck, Connect, ConnectFlags, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
};
use crate::WireError;

/// Default maximum packet size (4 MiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Largest value the four-byte remaining length can express
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Number of bytes the remaining length field takes for `len`
pub fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Write the MQTT variable length integer
pub fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), WireError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(WireError::Size(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Write a length-prefixed UTF-8 string
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_u8(body: &mut Bytes) -> Result<u8, WireError> {
    if body.remaining() < 1 {
        return Err(WireError::Malformed);
    }
    Ok(body.get_u8())
}

fn get_u16(body: &mut Bytes) -> Result<u16, WireError> {
    if body.remaining() < 2 {
        return Err(WireError::Malformed);
    }
    Ok(body.get_u16())
}

fn get_string(body: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let len = get_u16(body)? as usize;
    if body.remaining() < len {
        return Err(WireError::Malformed);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8(field))
}

/// Incremental MQTT packet decoder
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the buffer is left
    /// untouched in that case.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Peek at the remaining length without consuming anything
        let mut remaining = 0usize;
        let mut header_len = 0usize;
        for i in 0..4 {
            let pos = 1 + i;
            if pos >= buf.len() {
                return Ok(None);
            }
            let byte = buf[pos];
            remaining |= ((byte & 0x7F) as usize) << (7 * i);
            if byte & 0x80 == 0 {
                header_len = pos + 1;
                break;
            }
            if i == 3 {
                return Err(WireError::RemainingLength);
            }
        }

        if header_len + remaining > self.max_packet_size {
            return Err(WireError::Size(header_len + remaining));
        }
        if buf.len() < header_len + remaining {
            return Ok(None);
        }

        let first = buf[0];
        buf.advance(header_len);
        let body = buf.split_to(remaining).freeze();

        decode_body(first, body).map(Some)
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(first: u8, mut body: Bytes) -> Result<Packet, WireError> {
    let flags = first & 0x0F;
    match PacketType::try_from(first >> 4)? {
        PacketType::Connect => {
            let protocol = get_string(&mut body, "protocol name")?;
            if protocol.is_empty() {
                return Err(WireError::Malformed);
            }
            let _level = get_u8(&mut body)?;
            let connect_flags = ConnectFlags::from_bits_truncate(get_u8(&mut body)?);
            let keepalive = get_u16(&mut body)?;
            let client_id = get_string(&mut body, "client id")?;
            let username = if connect_flags.contains(ConnectFlags::USERNAME) {
                Some(get_string(&mut body, "username")?)
            } else {
                None
            };
            Ok(Packet::Connect(Connect {
                client_id,
                keepalive,
                clean_session: connect_flags.contains(ConnectFlags::CLEAN_SESSION),
                username,
            }))
        }
        PacketType::ConnAck => {
            let ack_flags = get_u8(&mut body)?;
            let code = get_u8(&mut body)?;
            Ok(Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 == 0x01,
                code,
            }))
        }
        PacketType::Publish => {
            let qos = QoS::try_from((flags >> 1) & 0x03)?;
            let topic = get_string(&mut body, "topic")?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(get_u16(&mut body)?),
            };
            Ok(Packet::Publish(Publish {
                topic,
                qos,
                packet_id,
                retain: flags & 0x01 == 0x01,
                dup: flags & 0x08 == 0x08,
                payload: body,
            }))
        }
        PacketType::PubAck => Ok(Packet::PubAck {
            packet_id: get_u16(&mut body)?,
        }),
        PacketType::Subscribe => {
            let packet_id = get_u16(&mut body)?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                let topic = get_string(&mut body, "topic filter")?;
                let qos = QoS::try_from(get_u8(&mut body)? & 0x03)?;
                topics.push((topic, qos));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
        }
        PacketType::SubAck => {
            let packet_id = get_u16(&mut body)?;
            Ok(Packet::SubAck(SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }))
        }
        PacketType::UnsubAck => Ok(Packet::UnsubAck {
            packet_id: get_u16(&mut body)?,
        }),
        PacketType::PingReq => Ok(Packet::PingReq),
        PacketType::PingResp => Ok(Packet::PingResp),
        PacketType::Disconnect => Ok(Packet::Disconnect),
        // Clients never receive UNSUBSCRIBE
        PacketType::Unsubscribe => Err(WireError::Type(first >> 4)),
    }
}
