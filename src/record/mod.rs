//! TLS record framing (RFC 5246 §6.2, RFC 8446 §5).
//!
//! Extracts record boundaries from a byte stream before decryption. The very
//! first record may use the SSLv2-compatible ClientHello framing (2- or
//! 3-byte header); everything after it is standard 5-byte framing.

pub mod alert;
pub mod buffer;
pub mod hello;

use crate::error::{Error, FramingError};
use alert::AlertDescription;

/// TLS record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

/// Negotiable protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Ssl2,
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl Protocol {
    /// Map a wire version to a protocol.
    pub fn from_wire(version: u16) -> Option<Self> {
        match version {
            0x0002 => Some(Self::Ssl2),
            0x0300 => Some(Self::Ssl3),
            0x0301 => Some(Self::Tls10),
            0x0302 => Some(Self::Tls11),
            0x0303 => Some(Self::Tls12),
            0x0304 => Some(Self::Tls13),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::Ssl2 => 0x0002,
            Self::Ssl3 => 0x0300,
            Self::Tls10 => 0x0301,
            Self::Tls11 => 0x0302,
            Self::Tls12 => 0x0303,
            Self::Tls13 => 0x0304,
        }
    }
}

/// Record framing in use on the inbound direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Nothing parsed yet; the first record decides.
    Unknown,
    /// SSLv2-compatible ClientHello framing.
    Ssl2,
    /// Standard 5-byte record framing.
    Ssl3Plus,
    Invalid,
}

/// Standard record header size.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record payload accepted: 2^14 plaintext plus expansion.
pub const MAX_RECORD_PAYLOAD: usize = 16384 + 2048;

/// Size of a synthesized alert record.
pub const ALERT_FRAME_LEN: usize = 7;

/// A parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub content_type: ContentType,
    /// Raw wire version (`0x0002` for SSLv2 framing).
    pub version: u16,
    /// Payload length excluding the header.
    pub length: usize,
    pub header_size: usize,
}

impl FrameHeader {
    /// Header plus payload.
    pub fn frame_size(&self) -> usize {
        self.header_size + self.length
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_wire(self.version)
    }
}

/// Decide the framing of the first record, or `Unknown` if more bytes are needed.
pub fn detect_framing(bytes: &[u8]) -> Framing {
    if bytes.len() < 3 {
        return Framing::Unknown;
    }
    if ContentType::from_byte(bytes[0]).is_some() {
        return if bytes[1] == 3 {
            Framing::Ssl3Plus
        } else {
            Framing::Invalid
        };
    }
    if bytes[0] & 0x80 != 0 {
        // 2-byte header, then msg_type (1 = ClientHello) and the version
        return if bytes[2] == 1 {
            Framing::Ssl2
        } else {
            Framing::Invalid
        };
    }
    // 3-byte header form carries padding length in the third byte
    if bytes.len() < 4 {
        return Framing::Unknown;
    }
    if bytes[3] == 1 {
        Framing::Ssl2
    } else {
        Framing::Invalid
    }
}

/// Parse a record header.
///
/// Returns `Ok(None)` when more bytes are needed. Fails on an unknown content
/// type, a major version other than 3, or a length above `MAX_RECORD_PAYLOAD`.
pub fn try_get_frame_header(bytes: &[u8], framing: Framing) -> Result<Option<FrameHeader>, Error> {
    match framing {
        Framing::Unknown => match detect_framing(bytes) {
            Framing::Unknown => Ok(None),
            Framing::Invalid => Err(FramingError::UnknownFraming.into()),
            detected => try_get_frame_header(bytes, detected),
        },
        Framing::Invalid => Err(FramingError::UnknownFraming.into()),
        Framing::Ssl2 => {
            if bytes.len() < 2 {
                return Ok(None);
            }
            let (length, header_size) = if bytes[0] & 0x80 != 0 {
                ((((bytes[0] & 0x7f) as usize) << 8) | bytes[1] as usize, 2)
            } else {
                if bytes.len() < 3 {
                    return Ok(None);
                }
                ((((bytes[0] & 0x3f) as usize) << 8) | bytes[1] as usize, 3)
            };
            if length > MAX_RECORD_PAYLOAD {
                return Err(FramingError::Oversized { length }.into());
            }
            Ok(Some(FrameHeader {
                content_type: ContentType::Handshake,
                version: Protocol::Ssl2.to_wire(),
                length,
                header_size,
            }))
        }
        Framing::Ssl3Plus => {
            if bytes.len() < RECORD_HEADER_LEN {
                return Ok(None);
            }
            let content_type = ContentType::from_byte(bytes[0])
                .ok_or(FramingError::InvalidContentType(bytes[0]))?;
            if bytes[1] != 3 {
                return Err(FramingError::UnsupportedVersion(bytes[1]).into());
            }
            let version = u16::from_be_bytes([bytes[1], bytes[2]]);
            let length = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
            if length > MAX_RECORD_PAYLOAD {
                return Err(FramingError::Oversized { length }.into());
            }
            Ok(Some(FrameHeader {
                content_type,
                version,
                length,
                header_size: RECORD_HEADER_LEN,
            }))
        }
    }
}

/// Build a plaintext fatal alert record.
pub fn create_alert_frame(version: u16, description: AlertDescription) -> [u8; ALERT_FRAME_LEN] {
    // SSLv2 peers still get a TLS 1.0 framed alert
    let version = if version >> 8 == 3 { version } else { 0x0301 };
    let [hi, lo] = version.to_be_bytes();
    [
        ContentType::Alert as u8,
        hi,
        lo,
        0,
        2,
        alert::AlertLevel::Fatal as u8,
        description.to_u8(),
    ]
}

/// Write a standard 5-byte record header.
pub fn encode_record_header(ct: ContentType, version: u16, length: usize, buf: &mut [u8]) -> Result<usize, Error> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::BufferTooSmall { needed: RECORD_HEADER_LEN });
    }
    if length > MAX_RECORD_PAYLOAD {
        return Err(FramingError::Oversized { length }.into());
    }
    buf[0] = ct as u8;
    buf[1..3].copy_from_slice(&version.to_be_bytes());
    buf[3..5].copy_from_slice(&(length as u16).to_be_bytes());
    Ok(RECORD_HEADER_LEN)
}
