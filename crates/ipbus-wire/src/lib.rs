//! IPbus packet and transaction encode/decode (transport-agnostic).
//!
//! All 32-bit words are little-endian on the wire. Version 2.0 frames
//! transactions inside packets carrying a packet header; version 1.3 sends
//! bare transaction streams and has no status/resend machinery.

pub mod status;
pub mod transaction;

use bytes::{Buf, BufMut};
use thiserror::Error;

pub use status::{
    decode_status_reply, encode_resend_request, encode_status_reply, encode_status_request,
    StatusReply, STATUS_TRACE_DEPTH, STATUS_WORDS,
};
pub use transaction::{
    decode_reply, decode_request, encode_reply, encode_request, reply_words, request_words,
    DecodedReply, DecodedRequest, RequestBody, TransactionHeader,
};

/// Reserved packet id of status and resend traffic.
pub const STATUS_PACKET_ID: u16 = 0;

/// Errors produced while encoding or decoding IPbus frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("header mismatch: {0}")]
    HeaderMismatch(String),
    #[error("unknown transaction type {0:#x}")]
    UnknownType(u32),
    #[error("{ty:?} is not available in protocol version {version}")]
    Unsupported {
        version: ProtocolVersion,
        ty: TransactionType,
    },
    #[error("transaction of {words} words exceeds the {version} limit")]
    TooManyWords {
        version: ProtocolVersion,
        words: usize,
    },
    #[error("device reported {code:?} for transaction {id}")]
    Device { code: InfoCode, id: u16 },
}

/// IPbus protocol versions understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Version 1.3: bare transaction streams, 9-bit word counts.
    V1_3,
    /// Version 2.0: packet headers, status and resend packets, 8-bit word counts.
    V2_0,
}

impl ProtocolVersion {
    /// The version nibble carried in packet and transaction headers.
    pub const fn nibble(self) -> u32 {
        match self {
            ProtocolVersion::V1_3 => 0x1,
            ProtocolVersion::V2_0 => 0x2,
        }
    }

    pub(crate) fn from_nibble(raw: u32) -> Result<Self, WireError> {
        match raw {
            0x1 => Ok(ProtocolVersion::V1_3),
            0x2 => Ok(ProtocolVersion::V2_0),
            other => Err(WireError::HeaderMismatch(format!(
                "unknown protocol version nibble {other:#x}"
            ))),
        }
    }

    /// Largest data block a single transaction can carry in this version.
    pub const fn max_block_words(self) -> usize {
        match self {
            ProtocolVersion::V1_3 => 511,
            ProtocolVersion::V2_0 => 255,
        }
    }

    /// Whether the version frames transactions inside packets.
    pub const fn has_packet_header(self) -> bool {
        matches!(self, ProtocolVersion::V2_0)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V1_3 => write!(f, "1.3"),
            ProtocolVersion::V2_0 => write!(f, "2.0"),
        }
    }
}

/// Packet-level frame kinds (version 2.0 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Carries a sequence of request or reply transactions.
    Control,
    /// Status request/reply used for negotiation and loss recovery.
    Status,
    /// Asks the device to re-send a cached control reply.
    Resend,
}

impl PacketType {
    const fn raw(self) -> u32 {
        match self {
            PacketType::Control => 0x0,
            PacketType::Status => 0x1,
            PacketType::Resend => 0x2,
        }
    }

    fn from_raw(raw: u32) -> Result<Self, WireError> {
        match raw {
            0x0 => Ok(PacketType::Control),
            0x1 => Ok(PacketType::Status),
            0x2 => Ok(PacketType::Resend),
            _ => Err(WireError::InvalidPacket("unknown packet type")),
        }
    }
}

/// Byte-order qualifier nibble expected in every version 2.0 packet header.
const BYTE_ORDER_QUALIFIER: u32 = 0xF;

/// Version 2.0 packet header.
///
/// Layout: version(4) | reserved(4) | packet id(16) | byte order(4) | type(4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: ProtocolVersion,
    pub ty: PacketType,
    pub id: u16,
}

impl PacketHeader {
    pub fn new(ty: PacketType, id: u16) -> Self {
        Self {
            version: ProtocolVersion::V2_0,
            ty,
            id,
        }
    }

    /// Raw 32-bit header word.
    pub fn encode(self) -> u32 {
        (self.version.nibble() << 28)
            | ((self.id as u32) << 8)
            | (BYTE_ORDER_QUALIFIER << 4)
            | self.ty.raw()
    }

    /// Decode a raw header word, checking the byte-order qualifier.
    pub fn decode(raw: u32) -> Result<Self, WireError> {
        let version = ProtocolVersion::from_nibble(raw >> 28)?;
        if version != ProtocolVersion::V2_0 {
            return Err(WireError::HeaderMismatch(format!(
                "packet header carries version {version}"
            )));
        }
        if (raw >> 4) & 0xF != BYTE_ORDER_QUALIFIER {
            return Err(WireError::InvalidPacket("bad byte-order qualifier"));
        }
        Ok(Self {
            version,
            ty: PacketType::from_raw(raw & 0xF)?,
            id: ((raw >> 8) & 0xFFFF) as u16,
        })
    }

    /// Append the header word to an outbound buffer.
    pub fn put(self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.encode());
    }

    /// Read the header word from an inbound buffer.
    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < 4 {
            return Err(WireError::InvalidPacket("truncated packet header"));
        }
        Self::decode(buf.get_u32_le())
    }
}

/// The operations a transaction can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// Block read at auto-incrementing addresses.
    Read,
    /// Block read at a fixed address (port access).
    NonIncRead,
    /// Block write at auto-incrementing addresses.
    Write,
    /// Block write at a fixed address.
    NonIncWrite,
    /// Read-modify-write with AND and OR terms.
    RmwBits,
    /// Read-modify-write adding a signed term.
    RmwSum,
    /// Read from the configuration address space.
    ConfigRead,
    /// Write to the configuration address space.
    ConfigWrite,
}

impl TransactionType {
    /// Whether the reply carries data words.
    pub const fn reply_has_data(self) -> bool {
        !matches!(
            self,
            TransactionType::Write | TransactionType::NonIncWrite | TransactionType::ConfigWrite
        )
    }

    pub(crate) fn raw(self, version: ProtocolVersion) -> Result<u32, WireError> {
        match version {
            ProtocolVersion::V2_0 => Ok(match self {
                TransactionType::Read => 0x0,
                TransactionType::Write => 0x1,
                TransactionType::NonIncRead => 0x2,
                TransactionType::NonIncWrite => 0x3,
                TransactionType::RmwBits => 0x4,
                TransactionType::RmwSum => 0x5,
                TransactionType::ConfigRead => 0x6,
                TransactionType::ConfigWrite => 0x7,
            }),
            ProtocolVersion::V1_3 => match self {
                TransactionType::Read => Ok(0x03),
                TransactionType::Write => Ok(0x04),
                TransactionType::RmwBits => Ok(0x05),
                TransactionType::RmwSum => Ok(0x06),
                TransactionType::NonIncRead => Ok(0x07),
                TransactionType::NonIncWrite => Ok(0x08),
                ty @ (TransactionType::ConfigRead | TransactionType::ConfigWrite) => {
                    Err(WireError::Unsupported { version, ty })
                }
            },
        }
    }

    pub(crate) fn from_raw(raw: u32, version: ProtocolVersion) -> Result<Self, WireError> {
        let ty = match (version, raw) {
            (ProtocolVersion::V2_0, 0x0) => TransactionType::Read,
            (ProtocolVersion::V2_0, 0x1) => TransactionType::Write,
            (ProtocolVersion::V2_0, 0x2) => TransactionType::NonIncRead,
            (ProtocolVersion::V2_0, 0x3) => TransactionType::NonIncWrite,
            (ProtocolVersion::V2_0, 0x4) => TransactionType::RmwBits,
            (ProtocolVersion::V2_0, 0x5) => TransactionType::RmwSum,
            (ProtocolVersion::V2_0, 0x6) => TransactionType::ConfigRead,
            (ProtocolVersion::V2_0, 0x7) => TransactionType::ConfigWrite,
            (ProtocolVersion::V1_3, 0x03) => TransactionType::Read,
            (ProtocolVersion::V1_3, 0x04) => TransactionType::Write,
            (ProtocolVersion::V1_3, 0x05) => TransactionType::RmwBits,
            (ProtocolVersion::V1_3, 0x06) => TransactionType::RmwSum,
            (ProtocolVersion::V1_3, 0x07) => TransactionType::NonIncRead,
            (ProtocolVersion::V1_3, 0x08) => TransactionType::NonIncWrite,
            (_, other) => return Err(WireError::UnknownType(other)),
        };
        Ok(ty)
    }
}

/// Per-transaction reply diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCode {
    /// Transaction completed on the device.
    Success,
    /// The device rejected the request header.
    BadHeader,
    /// Bus error while reading.
    BusReadError,
    /// Bus error while writing.
    BusWriteError,
    /// Bus timeout while reading.
    BusReadTimeout,
    /// Bus timeout while writing.
    BusWriteTimeout,
    /// Marks an outbound request (not a reply diagnostic).
    Request,
    /// A code this implementation does not know.
    Unknown(u8),
}

impl InfoCode {
    /// Convert from the raw info nibble.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x0 => InfoCode::Success,
            0x1 => InfoCode::BadHeader,
            0x4 => InfoCode::BusReadError,
            0x5 => InfoCode::BusWriteError,
            0x6 => InfoCode::BusReadTimeout,
            0x7 => InfoCode::BusWriteTimeout,
            0xF => InfoCode::Request,
            other => InfoCode::Unknown(other as u8),
        }
    }

    /// Raw nibble value stored in the header.
    pub const fn to_raw(self) -> u32 {
        match self {
            InfoCode::Success => 0x0,
            InfoCode::BadHeader => 0x1,
            InfoCode::BusReadError => 0x4,
            InfoCode::BusWriteError => 0x5,
            InfoCode::BusReadTimeout => 0x6,
            InfoCode::BusWriteTimeout => 0x7,
            InfoCode::Request => 0xF,
            InfoCode::Unknown(code) => code as u32,
        }
    }
}
