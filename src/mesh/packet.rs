//! Wire format.
//!
//! ```text
//! [0] src   [1] dest (0xFF = broadcast)   [2] type   [3..] payload
//! ```
//!
//! Control payloads are fixed-size little-endian records. Every decoder checks
//! the declared length before reading a field; trailing bytes are ignored so
//! frames padded by older peers still parse.

use serde::Serialize;
use std::fmt;

use crate::config::MAX_NODE_NAME_LEN;
use crate::error::{MeshError, MeshResult};

pub const BROADCAST: u8 = 0xFF;
pub const HEADER_LEN: usize = 3;
/// Largest payload accepted for transmission.
pub const MAX_PAYLOAD_LEN: usize = 240;
/// Physical-layer frame limit.
pub const MAX_FRAME_LEN: usize = 256;

const NAME_FIELD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageType {
    Data,
    Ping,
    Pong,
    Beacon,
    RouteRequest,
    RouteReply,
    ConfigSync,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(b: u8) -> Self {
        match b {
            0x01 => MessageType::Data,
            0x02 => MessageType::Ping,
            0x03 => MessageType::Pong,
            0x04 => MessageType::Beacon,
            0x05 => MessageType::RouteRequest,
            0x06 => MessageType::RouteReply,
            0x07 => MessageType::ConfigSync,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Data => 0x01,
            MessageType::Ping => 0x02,
            MessageType::Pong => 0x03,
            MessageType::Beacon => 0x04,
            MessageType::RouteRequest => 0x05,
            MessageType::RouteReply => 0x06,
            MessageType::ConfigSync => 0x07,
            MessageType::Unknown(b) => b,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Data => write!(f, "DATA"),
            MessageType::Ping => write!(f, "PING"),
            MessageType::Pong => write!(f, "PONG"),
            MessageType::Beacon => write!(f, "BEACON"),
            MessageType::RouteRequest => write!(f, "RREQ"),
            MessageType::RouteReply => write!(f, "RREP"),
            MessageType::ConfigSync => write!(f, "CONFIG_SYNC"),
            MessageType::Unknown(b) => write!(f, "0x{:02X}", b),
        }
    }
}

/// A received or outgoing frame. `rssi`/`snr` are receive metadata and are
/// not part of the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: u8,
    pub dest: u8,
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    pub rssi: i16,
    pub snr: i8,
}

impl Packet {
    pub fn new(src: u8, dest: u8, msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            src,
            dest,
            msg_type,
            payload,
            rssi: 0,
            snr: 0,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(MeshError::FrameTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.src);
        out.push(self.dest);
        out.push(self.msg_type.into());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(MeshError::Malformed(format!(
                "frame of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        Ok(Self {
            src: bytes[0],
            dest: bytes[1],
            msg_type: MessageType::from(bytes[2]),
            payload: bytes[HEADER_LEN..].to_vec(),
            rssi: 0,
            snr: 0,
        })
    }

    pub fn with_signal(mut self, rssi: i16, snr: i8) -> Self {
        self.rssi = rssi;
        self.snr = snr;
        self
    }
}

/// Fixed-layout payload record.
pub trait WirePayload: Sized {
    const LEN: usize;
    const NAME: &'static str;

    fn encode(&self) -> Vec<u8>;
    fn decode_fields(b: &[u8]) -> Self;

    fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < Self::LEN {
            return Err(MeshError::Malformed(format!(
                "{} payload is {} bytes, need {}",
                Self::NAME,
                bytes.len(),
                Self::LEN
            )));
        }
        Ok(Self::decode_fields(&bytes[..Self::LEN]))
    }
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_i16(b: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub node_id: u8,
    pub name: String,
    pub sequence: u16,
    pub rssi: i16,
    pub hop_count: u8,
}

impl WirePayload for Beacon {
    const LEN: usize = 1 + NAME_FIELD_LEN + 2 + 2 + 1;
    const NAME: &'static str = "beacon";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.node_id);
        let mut name = [0u8; NAME_FIELD_LEN];
        let raw = self.name.as_bytes();
        let n = raw.len().min(MAX_NODE_NAME_LEN);
        name[..n].copy_from_slice(&raw[..n]);
        out.extend_from_slice(&name);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.rssi.to_le_bytes());
        out.push(self.hop_count);
        out
    }

    fn decode_fields(b: &[u8]) -> Self {
        let field = &b[1..1 + NAME_FIELD_LEN];
        let end = field.iter().position(|&c| c == 0).unwrap_or(MAX_NODE_NAME_LEN);
        let end = end.min(MAX_NODE_NAME_LEN);
        Self {
            node_id: b[0],
            name: String::from_utf8_lossy(&field[..end]).into_owned(),
            sequence: le_u16(b, 33),
            rssi: le_i16(b, 35),
            hop_count: b[37],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub node_id: u8,
    pub sequence: u16,
    pub timestamp_ms: u32,
}

impl WirePayload for Ping {
    const LEN: usize = 7;
    const NAME: &'static str = "ping";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.node_id);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out
    }

    fn decode_fields(b: &[u8]) -> Self {
        Self {
            node_id: b[0],
            sequence: le_u16(b, 1),
            timestamp_ms: le_u32(b, 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub node_id: u8,
    pub ping_sequence: u16,
    /// The ping's timestamp, echoed unchanged.
    pub timestamp_ms: u32,
    /// Informational; receivers compute RTT themselves.
    pub rtt_ms: u32,
}

impl WirePayload for Pong {
    const LEN: usize = 11;
    const NAME: &'static str = "pong";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.node_id);
        out.extend_from_slice(&self.ping_sequence.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.rtt_ms.to_le_bytes());
        out
    }

    fn decode_fields(b: &[u8]) -> Self {
        Self {
            node_id: b[0],
            ping_sequence: le_u16(b, 1),
            timestamp_ms: le_u32(b, 3),
            rtt_ms: le_u32(b, 7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    /// Node that started the discovery.
    pub origin: u8,
    /// Node being looked for.
    pub target: u8,
    pub sequence: u16,
    pub hop_count: u8,
}

impl WirePayload for RouteRequest {
    const LEN: usize = 5;
    const NAME: &'static str = "route request";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.origin);
        out.push(self.target);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.hop_count);
        out
    }

    fn decode_fields(b: &[u8]) -> Self {
        Self {
            origin: b[0],
            target: b[1],
            sequence: le_u16(b, 2),
            hop_count: b[4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteReply {
    /// The node that was looked for (wire `src`).
    pub target: u8,
    /// The node that started the discovery (wire `dest`).
    pub origin: u8,
    pub sequence: u16,
    pub hop_count: u8,
}

impl WirePayload for RouteReply {
    const LEN: usize = 5;
    const NAME: &'static str = "route reply";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.target);
        out.push(self.origin);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.hop_count);
        out
    }

    fn decode_fields(b: &[u8]) -> Self {
        Self {
            target: b[0],
            origin: b[1],
            sequence: le_u16(b, 2),
            hop_count: b[4],
        }
    }
}

/// DATA payload: end-to-end addressing in front of the application bytes. The
/// frame header only carries the current link hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEnvelope {
    pub origin: u8,
    pub final_dest: u8,
    pub body: Vec<u8>,
}

impl DataEnvelope {
    pub const OVERHEAD: usize = 2;
    pub const MAX_BODY_LEN: usize = MAX_PAYLOAD_LEN - Self::OVERHEAD;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::OVERHEAD + self.body.len());
        out.push(self.origin);
        out.push(self.final_dest);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < Self::OVERHEAD {
            return Err(MeshError::Malformed(format!(
                "data payload is {} bytes, need at least {}",
                bytes.len(),
                Self::OVERHEAD
            )));
        }
        Ok(Self {
            origin: bytes[0],
            final_dest: bytes[1],
            body: bytes[Self::OVERHEAD..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_codes_match_wire_table() {
        let table = [
            (0x01, MessageType::Data),
            (0x02, MessageType::Ping),
            (0x03, MessageType::Pong),
            (0x04, MessageType::Beacon),
            (0x05, MessageType::RouteRequest),
            (0x06, MessageType::RouteReply),
            (0x07, MessageType::ConfigSync),
        ];
        for (code, ty) in table {
            assert_eq!(MessageType::from(code), ty);
            assert_eq!(u8::from(ty), code);
        }
        assert_eq!(MessageType::from(0x42), MessageType::Unknown(0x42));
        assert_eq!(u8::from(MessageType::Unknown(0x42)), 0x42);
    }

    #[test]
    fn header_layout() {
        let p = Packet::new(3, BROADCAST, MessageType::Beacon, vec![9, 8]);
        assert_eq!(p.to_bytes().unwrap(), vec![3, 0xFF, 0x04, 9, 8]);
        let back = Packet::from_bytes(&[7, 2, 0x05, 1]).unwrap();
        assert_eq!((back.src, back.dest), (7, 2));
        assert_eq!(back.msg_type, MessageType::RouteRequest);
        assert_eq!(back.payload, vec![1]);
    }

    #[test]
    fn short_frames_and_oversized_payloads_are_rejected() {
        assert!(matches!(
            Packet::from_bytes(&[1, 2]),
            Err(MeshError::Malformed(_))
        ));
        let big = Packet::new(1, 2, MessageType::Data, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            big.to_bytes(),
            Err(MeshError::FrameTooLarge { len: 241, max: 240 })
        ));
        let max = Packet::new(1, 2, MessageType::Data, vec![0; MAX_PAYLOAD_LEN]);
        assert_eq!(max.to_bytes().unwrap().len(), MAX_PAYLOAD_LEN + HEADER_LEN);
    }

    #[test]
    fn payload_sizes_are_fixed() {
        assert_eq!(Beacon::LEN, 38);
        assert_eq!(Ping::LEN, 7);
        assert_eq!(Pong::LEN, 11);
        assert_eq!(RouteRequest::LEN, 5);
        assert_eq!(RouteReply::LEN, 5);
    }

    #[test]
    fn beacon_fields_are_little_endian_with_padded_name() {
        let b = Beacon {
            node_id: 5,
            name: "relay".into(),
            sequence: 0x0102,
            rssi: -60,
            hop_count: 2,
        };
        let bytes = b.encode();
        assert_eq!(bytes.len(), 38);
        assert_eq!(&bytes[1..6], b"relay");
        assert!(bytes[6..33].iter().all(|&c| c == 0));
        assert_eq!(&bytes[33..35], &[0x02, 0x01]);
        assert_eq!(i16::from_le_bytes([bytes[35], bytes[36]]), -60);
        assert_eq!(Beacon::decode(&bytes).unwrap(), b);
    }

    #[test]
    fn beacon_name_without_terminator_is_clamped() {
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&[b'a'; 32]);
        bytes.extend_from_slice(&[0, 0, 0, 0, 1]);
        let b = Beacon::decode(&bytes).unwrap();
        assert_eq!(b.name.len(), MAX_NODE_NAME_LEN);
        assert_eq!(b.hop_count, 1);
    }

    #[test]
    fn truncated_payloads_are_malformed_and_padding_is_ignored() {
        assert!(Ping::decode(&[1, 2, 3]).is_err());
        assert!(RouteRequest::decode(&[1, 2, 3, 4]).is_err());
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 777,
            hop_count: 0,
        };
        let mut bytes = rreq.encode();
        bytes.extend_from_slice(&[11; 11]);
        assert_eq!(RouteRequest::decode(&bytes).unwrap(), rreq);
    }

    #[test]
    fn route_reply_puts_target_first() {
        let rrep = RouteReply {
            target: 9,
            origin: 2,
            sequence: 1,
            hop_count: 3,
        };
        assert_eq!(rrep.encode(), vec![9, 2, 1, 0, 3]);
    }

    #[test]
    fn pong_echoes_timestamp_field_position() {
        let pong = Pong {
            node_id: 4,
            ping_sequence: 10,
            timestamp_ms: 0xAABBCCDD,
            rtt_ms: 0,
        };
        let bytes = pong.encode();
        assert_eq!(&bytes[3..7], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(Pong::decode(&bytes).unwrap(), pong);
    }

    #[test]
    fn data_envelope_needs_addressing() {
        assert!(DataEnvelope::decode(&[1]).is_err());
        let env = DataEnvelope::decode(&[2, 9, b'h', b'i']).unwrap();
        assert_eq!((env.origin, env.final_dest), (2, 9));
        assert_eq!(env.body, b"hi");
        assert_eq!(DataEnvelope::MAX_BODY_LEN, 238);
    }
}
