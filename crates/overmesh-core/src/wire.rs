//! Overmesh wire format: the datagram frame and the logical message it carries.
//!
//! A frame is a fixed `FrameHeader` followed by three variable sections:
//! service name, service param and body. The header is `#[repr(C, packed)]`
//! with zerocopy derives, so parsing it is a bounds check and a copy.
//! Multi-byte fields are little-endian on the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::codec::{self, CodecError};
use crate::id::PeerId;

// ── Logical message ───────────────────────────────────────────────────────────

/// Body encoding of a [`WireMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Plain JSON document.
    Json,
    /// Gzip-compressed JSON document.
    Gzip,
}

/// A message addressed to a service endpoint (`service` + `param`).
///
/// This is what transports move around. The body is an already-encoded
/// document; transports never look inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub service: String,
    pub param: String,
    pub encoding: Encoding,
    #[serde(with = "hex_bytes")]
    pub body: Bytes,
}

impl WireMessage {
    /// Encode `value` into a new message for `service`/`param`.
    pub fn encode<T: Serialize>(
        service: impl Into<String>,
        param: impl Into<String>,
        value: &T,
        encoding: Encoding,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            service: service.into(),
            param: param.into(),
            encoding,
            body: codec::encode(value, encoding)?,
        })
    }

    /// Decode the body as `T`, inflating first if needed.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode(&self.body, self.encoding)
    }

    /// Same message, re-addressed to another service endpoint.
    pub fn readdress(mut self, service: &str, param: &str) -> Self {
        self.service = service.to_string();
        self.param = param.to_string();
        self
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// Fixed header at the start of every datagram.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always `FRAME_MAGIC`. Anything else is not ours and is dropped.
    pub magic: [u8; 4],

    /// Frame format version. Currently 0x01.
    pub version: u8,

    /// Bit flags:
    ///   bit    0: frame was sent to the local multicast group
    ///   bit    2: body is gzip-compressed
    ///   bits 1,3-7: reserved, must be zero
    pub flags: u8,

    /// Remaining local flood budget. Zero for unicast frames.
    pub ttl: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// Sending peer. Receivers learn a route to this peer from the
    /// datagram's source address.
    pub source: [u8; 32],

    /// Length of the service name section (UTF-8).
    pub service_len: u16,

    /// Length of the service param section (UTF-8).
    pub param_len: u16,

    /// Length of the body section.
    pub body_len: u32,
}

assert_eq_size!(FrameHeader, [u8; 48]);

/// Size of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Magic bytes at the start of every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"OVMS";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

pub const FLAG_MULTICAST: u8 = 0x01;
pub const FLAG_GZIP: u8 = 0x04;
const KNOWN_FLAGS: u8 = FLAG_MULTICAST | FLAG_GZIP;

/// Largest frame that fits a UDP datagram.
pub const MAX_FRAME: usize = 65_507;

/// IPv6 link-local multicast address used for the local neighbor flood.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// Default UDP port for overlay traffic.
pub const DEFAULT_PORT: u16 = 9700;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: PeerId,
    pub ttl: u8,
    pub multicast: bool,
    pub message: WireMessage,
}

/// Serialize a message into a single datagram.
pub fn encode_frame(
    source: &PeerId,
    message: &WireMessage,
    ttl: u8,
    multicast: bool,
) -> Result<Vec<u8>, WireError> {
    let service = message.service.as_bytes();
    let param = message.param.as_bytes();
    let service_len =
        u16::try_from(service.len()).map_err(|_| WireError::FieldTooLong("service", service.len()))?;
    let param_len =
        u16::try_from(param.len()).map_err(|_| WireError::FieldTooLong("param", param.len()))?;

    let total = FRAME_HEADER_LEN + service.len() + param.len() + message.body.len();
    if total > MAX_FRAME {
        return Err(WireError::FrameTooLarge(total));
    }

    let mut flags = 0u8;
    if multicast {
        flags |= FLAG_MULTICAST;
    }
    if message.encoding == Encoding::Gzip {
        flags |= FLAG_GZIP;
    }

    let header = FrameHeader {
        magic: FRAME_MAGIC,
        version: FRAME_VERSION,
        flags,
        ttl,
        reserved: 0,
        source: *source.as_bytes(),
        service_len: service_len.to_le(),
        param_len: param_len.to_le(),
        body_len: (message.body.len() as u32).to_le(),
    };

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(service);
    out.extend_from_slice(param);
    out.extend_from_slice(&message.body);
    Ok(out)
}

/// Parse a datagram. Trailing bytes past the declared sections are ignored.
pub fn decode_frame(data: &[u8]) -> Result<Frame, WireError> {
    let header = FrameHeader::read_from_prefix(data).ok_or(WireError::Truncated {
        needed: FRAME_HEADER_LEN,
        have: data.len(),
    })?;

    if header.magic != FRAME_MAGIC {
        return Err(WireError::BadMagic);
    }
    if header.version != FRAME_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    if header.flags & !KNOWN_FLAGS != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags));
    }

    // Copy packed fields to locals before use.
    let service_len = u16::from_le(header.service_len) as usize;
    let param_len = u16::from_le(header.param_len) as usize;
    let body_len = u32::from_le(header.body_len) as usize;

    let needed = FRAME_HEADER_LEN + service_len + param_len + body_len;
    if data.len() < needed {
        return Err(WireError::Truncated {
            needed,
            have: data.len(),
        });
    }

    let mut at = FRAME_HEADER_LEN;
    let service = std::str::from_utf8(&data[at..at + service_len])
        .map_err(|_| WireError::InvalidUtf8("service"))?;
    at += service_len;
    let param = std::str::from_utf8(&data[at..at + param_len])
        .map_err(|_| WireError::InvalidUtf8("param"))?;
    at += param_len;
    let body = Bytes::copy_from_slice(&data[at..at + body_len]);

    let encoding = if header.flags & FLAG_GZIP != 0 {
        Encoding::Gzip
    } else {
        Encoding::Json
    };

    Ok(Frame {
        source: PeerId::from_bytes(header.source),
        ttl: header.ttl,
        multicast: header.flags & FLAG_MULTICAST != 0,
        message: WireMessage {
            service: service.to_string(),
            param: param.to_string(),
            encoding,
            body,
        },
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic")]
    BadMagic,

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("{0} section is {1} bytes, too long for the frame header")]
    FieldTooLong(&'static str, usize),

    #[error("{0} section is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("frame of {0} bytes exceeds maximum {}", MAX_FRAME)]
    FrameTooLarge(usize),
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(encoding: Encoding) -> WireMessage {
        WireMessage::encode(
            "overmesh.resolver",
            "query",
            &serde_json::json!({ "q": "hello" }),
            encoding,
        )
        .unwrap()
    }

    #[test]
    fn frame_carries_source_and_sections() {
        let source = PeerId::from_bytes([0x42; 32]);
        let message = sample(Encoding::Json);

        let bytes = encode_frame(&source, &message, 0, false).unwrap();
        assert_eq!(&bytes[..4], b"OVMS");

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.source, source);
        assert_eq!(frame.ttl, 0);
        assert!(!frame.multicast);
        assert_eq!(frame.message, message);
    }

    #[test]
    fn gzip_body_sets_flag() {
        let source = PeerId::random();
        let bytes = encode_frame(&source, &sample(Encoding::Gzip), 2, true).unwrap();
        assert_eq!(bytes[5], FLAG_MULTICAST | FLAG_GZIP);

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.message.encoding, Encoding::Gzip);
        assert_eq!(frame.ttl, 2);
        assert!(frame.multicast);
        let doc: serde_json::Value = frame.message.decode().unwrap();
        assert_eq!(doc["q"], "hello");
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = encode_frame(&PeerId::random(), &sample(Encoding::Json), 0, false).unwrap();
        let err = decode_frame(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
        assert!(matches!(
            decode_frame(&bytes[..10]).unwrap_err(),
            WireError::Truncated { needed: FRAME_HEADER_LEN, have: 10 }
        ));
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        let mut bytes = encode_frame(&PeerId::random(), &sample(Encoding::Json), 0, false).unwrap();
        bytes[0] = b'X';
        assert_eq!(decode_frame(&bytes).unwrap_err(), WireError::BadMagic);

        let mut bytes = encode_frame(&PeerId::random(), &sample(Encoding::Json), 0, false).unwrap();
        bytes[5] = 0x80;
        assert_eq!(decode_frame(&bytes).unwrap_err(), WireError::ReservedFlagsSet(0x80));
    }

    #[test]
    fn wire_message_json_uses_hex_body() {
        let message = sample(Encoding::Json);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["encoding"], "json");
        assert!(json["body"].as_str().unwrap().chars().all(|c| c.is_ascii_hexdigit()));
        let back: WireMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
