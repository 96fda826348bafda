//! Transaction-level encode/decode for both protocol versions.
//!
//! Version 2.0 header layout: version(4) | id(12) | words(8) | type(4) | info(4).
//! Version 1.3 header layout: version(4) | id(11) | words(9) | type(5) | info(3).

use bytes::{Buf, BufMut};

use crate::{InfoCode, ProtocolVersion, TransactionType, WireError};

/// Transaction header in decoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    pub version: ProtocolVersion,
    pub id: u16,
    pub words: u16,
    pub ty: TransactionType,
    pub info: InfoCode,
}

impl TransactionHeader {
    /// Largest transaction id representable in this version.
    pub const fn max_id(version: ProtocolVersion) -> u16 {
        match version {
            ProtocolVersion::V1_3 => 0x7FF,
            ProtocolVersion::V2_0 => 0xFFF,
        }
    }

    /// Raw 32-bit header word.
    pub fn encode(self) -> Result<u32, WireError> {
        if self.id > Self::max_id(self.version) {
            return Err(WireError::HeaderMismatch(format!(
                "transaction id {} out of range for version {}",
                self.id, self.version
            )));
        }
        if self.words as usize > self.version.max_block_words() {
            return Err(WireError::TooManyWords {
                version: self.version,
                words: self.words as usize,
            });
        }
        let ty = self.ty.raw(self.version)?;
        let raw = match self.version {
            ProtocolVersion::V2_0 => {
                (self.version.nibble() << 28)
                    | ((self.id as u32) << 16)
                    | ((self.words as u32) << 8)
                    | (ty << 4)
                    | self.info.to_raw()
            }
            ProtocolVersion::V1_3 => {
                (self.version.nibble() << 28)
                    | ((self.id as u32) << 17)
                    | ((self.words as u32) << 8)
                    | (ty << 3)
                    | info_to_raw_1_3(self.info)
            }
        };
        Ok(raw)
    }

    /// Decode a raw header word, insisting on the expected version.
    pub fn decode(raw: u32, version: ProtocolVersion) -> Result<Self, WireError> {
        let carried = ProtocolVersion::from_nibble(raw >> 28)?;
        if carried != version {
            return Err(WireError::HeaderMismatch(format!(
                "transaction header carries version {carried}, expected {version}"
            )));
        }
        match version {
            ProtocolVersion::V2_0 => Ok(Self {
                version,
                id: ((raw >> 16) & 0xFFF) as u16,
                words: ((raw >> 8) & 0xFF) as u16,
                ty: TransactionType::from_raw((raw >> 4) & 0xF, version)?,
                info: InfoCode::from_raw(raw & 0xF),
            }),
            ProtocolVersion::V1_3 => Ok(Self {
                version,
                id: ((raw >> 17) & 0x7FF) as u16,
                words: ((raw >> 8) & 0x1FF) as u16,
                ty: TransactionType::from_raw((raw >> 3) & 0x1F, version)?,
                info: info_from_raw_1_3(raw & 0x7),
            }),
        }
    }
}

// The 1.3 info field is only three bits wide, so the 2.0 code points do not
// fit verbatim.
fn info_to_raw_1_3(info: InfoCode) -> u32 {
    match info {
        InfoCode::Success => 0x0,
        InfoCode::BadHeader => 0x1,
        InfoCode::BusReadError | InfoCode::BusReadTimeout => 0x2,
        InfoCode::BusWriteError | InfoCode::BusWriteTimeout => 0x3,
        InfoCode::Request => 0x4,
        InfoCode::Unknown(code) => (code as u32) & 0x7,
    }
}

fn info_from_raw_1_3(raw: u32) -> InfoCode {
    match raw {
        0x0 => InfoCode::Success,
        0x1 => InfoCode::BadHeader,
        0x2 => InfoCode::BusReadError,
        0x3 => InfoCode::BusWriteError,
        0x4 => InfoCode::Request,
        other => InfoCode::Unknown(other as u8),
    }
}

/// Payload of a request transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Read { addr: u32, words: u16 },
    NonIncRead { addr: u32, words: u16 },
    ConfigRead { addr: u32, words: u16 },
    Write { addr: u32, data: Vec<u32> },
    NonIncWrite { addr: u32, data: Vec<u32> },
    ConfigWrite { addr: u32, data: Vec<u32> },
    RmwBits { addr: u32, and: u32, or: u32 },
    RmwSum { addr: u32, addend: u32 },
}

impl RequestBody {
    /// The transaction type this body requests.
    pub fn ty(&self) -> TransactionType {
        match self {
            RequestBody::Read { .. } => TransactionType::Read,
            RequestBody::NonIncRead { .. } => TransactionType::NonIncRead,
            RequestBody::ConfigRead { .. } => TransactionType::ConfigRead,
            RequestBody::Write { .. } => TransactionType::Write,
            RequestBody::NonIncWrite { .. } => TransactionType::NonIncWrite,
            RequestBody::ConfigWrite { .. } => TransactionType::ConfigWrite,
            RequestBody::RmwBits { .. } => TransactionType::RmwBits,
            RequestBody::RmwSum { .. } => TransactionType::RmwSum,
        }
    }

    /// Base address targeted by the request.
    pub fn addr(&self) -> u32 {
        match self {
            RequestBody::Read { addr, .. }
            | RequestBody::NonIncRead { addr, .. }
            | RequestBody::ConfigRead { addr, .. }
            | RequestBody::Write { addr, .. }
            | RequestBody::NonIncWrite { addr, .. }
            | RequestBody::ConfigWrite { addr, .. }
            | RequestBody::RmwBits { addr, .. }
            | RequestBody::RmwSum { addr, .. } => *addr,
        }
    }

    /// Word count carried in the request header.
    pub fn header_words(&self) -> u16 {
        match self {
            RequestBody::Read { words, .. }
            | RequestBody::NonIncRead { words, .. }
            | RequestBody::ConfigRead { words, .. } => *words,
            RequestBody::Write { data, .. }
            | RequestBody::NonIncWrite { data, .. }
            | RequestBody::ConfigWrite { data, .. } => data.len() as u16,
            RequestBody::RmwBits { .. } | RequestBody::RmwSum { .. } => 1,
        }
    }
}

/// Number of 32-bit words the encoded request occupies in a packet.
pub fn request_words(body: &RequestBody) -> usize {
    // Header and address words, then the operand payload.
    2 + match body {
        RequestBody::Read { .. }
        | RequestBody::NonIncRead { .. }
        | RequestBody::ConfigRead { .. } => 0,
        RequestBody::Write { data, .. }
        | RequestBody::NonIncWrite { data, .. }
        | RequestBody::ConfigWrite { data, .. } => data.len(),
        RequestBody::RmwBits { .. } => 2,
        RequestBody::RmwSum { .. } => 1,
    }
}

/// Number of 32-bit words the matching reply will occupy.
pub fn reply_words(ty: TransactionType, header_words: u16) -> usize {
    1 + reply_data_words(ty, header_words)
}

fn reply_data_words(ty: TransactionType, header_words: u16) -> usize {
    match ty {
        TransactionType::Read | TransactionType::NonIncRead | TransactionType::ConfigRead => {
            header_words as usize
        }
        TransactionType::RmwBits | TransactionType::RmwSum => 1,
        TransactionType::Write | TransactionType::NonIncWrite | TransactionType::ConfigWrite => 0,
    }
}

/// Append an encoded request transaction to an outbound packet.
pub fn encode_request(
    buf: &mut impl BufMut,
    version: ProtocolVersion,
    id: u16,
    body: &RequestBody,
) -> Result<(), WireError> {
    let words = body.header_words();
    if words as usize > version.max_block_words() {
        return Err(WireError::TooManyWords {
            version,
            words: words as usize,
        });
    }
    let header = TransactionHeader {
        version,
        id,
        words,
        ty: body.ty(),
        info: InfoCode::Request,
    };
    buf.put_u32_le(header.encode()?);
    buf.put_u32_le(body.addr());
    match body {
        RequestBody::Read { .. }
        | RequestBody::NonIncRead { .. }
        | RequestBody::ConfigRead { .. } => {}
        RequestBody::Write { data, .. }
        | RequestBody::NonIncWrite { data, .. }
        | RequestBody::ConfigWrite { data, .. } => {
            for word in data {
                buf.put_u32_le(*word);
            }
        }
        RequestBody::RmwBits { and, or, .. } => {
            buf.put_u32_le(*and);
            buf.put_u32_le(*or);
        }
        RequestBody::RmwSum { addend, .. } => {
            buf.put_u32_le(*addend);
        }
    }
    Ok(())
}

fn take_payload(buf: &mut impl Buf, n: usize) -> Result<Vec<u32>, WireError> {
    if buf.remaining() < n * 4 {
        return Err(WireError::InvalidPacket("truncated request payload"));
    }
    Ok((0..n).map(|_| buf.get_u32_le()).collect())
}

/// A request transaction pulled off the wire (device side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub header: TransactionHeader,
    pub body: RequestBody,
}

/// Decode the next request transaction from an inbound control packet.
pub fn decode_request(
    buf: &mut impl Buf,
    version: ProtocolVersion,
) -> Result<DecodedRequest, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::InvalidPacket("truncated request transaction"));
    }
    let header = TransactionHeader::decode(buf.get_u32_le(), version)?;
    if header.info != InfoCode::Request {
        return Err(WireError::HeaderMismatch(format!(
            "inbound transaction {} does not carry the request marker",
            header.id
        )));
    }
    let addr = buf.get_u32_le();
    let body = match header.ty {
        TransactionType::Read => RequestBody::Read {
            addr,
            words: header.words,
        },
        TransactionType::NonIncRead => RequestBody::NonIncRead {
            addr,
            words: header.words,
        },
        TransactionType::ConfigRead => RequestBody::ConfigRead {
            addr,
            words: header.words,
        },
        TransactionType::Write => RequestBody::Write {
            addr,
            data: take_payload(buf, header.words as usize)?,
        },
        TransactionType::NonIncWrite => RequestBody::NonIncWrite {
            addr,
            data: take_payload(buf, header.words as usize)?,
        },
        TransactionType::ConfigWrite => RequestBody::ConfigWrite {
            addr,
            data: take_payload(buf, header.words as usize)?,
        },
        TransactionType::RmwBits => {
            let payload = take_payload(buf, 2)?;
            RequestBody::RmwBits {
                addr,
                and: payload[0],
                or: payload[1],
            }
        }
        TransactionType::RmwSum => {
            let payload = take_payload(buf, 1)?;
            RequestBody::RmwSum {
                addr,
                addend: payload[0],
            }
        }
    };
    Ok(DecodedRequest { header, body })
}

/// Append an encoded reply transaction (device side).
pub fn encode_reply(
    buf: &mut impl BufMut,
    version: ProtocolVersion,
    id: u16,
    ty: TransactionType,
    info: InfoCode,
    words: u16,
    data: &[u32],
) -> Result<(), WireError> {
    let header = TransactionHeader {
        version,
        id,
        words,
        ty,
        info,
    };
    buf.put_u32_le(header.encode()?);
    for word in data {
        buf.put_u32_le(*word);
    }
    Ok(())
}

/// A reply transaction matched against its queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedReply {
    pub info: InfoCode,
    pub data: Vec<u32>,
}

/// Decode the next reply transaction, validating the echoed header fields.
///
/// A non-success [`InfoCode`] is returned in the reply rather than as an
/// error: the device failed this transaction but the rest of the packet is
/// still well-formed.
pub fn decode_reply(
    buf: &mut impl Buf,
    version: ProtocolVersion,
    expected_id: u16,
    expected_ty: TransactionType,
    expected_words: u16,
) -> Result<DecodedReply, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::InvalidPacket("truncated reply transaction"));
    }
    let header = TransactionHeader::decode(buf.get_u32_le(), version)?;
    if header.id != expected_id {
        return Err(WireError::HeaderMismatch(format!(
            "reply transaction id {} does not match request {expected_id}",
            header.id
        )));
    }
    if header.ty != expected_ty {
        return Err(WireError::HeaderMismatch(format!(
            "reply type {:?} does not match request {expected_ty:?}",
            header.ty
        )));
    }
    if header.info == InfoCode::Request {
        return Err(WireError::HeaderMismatch(format!(
            "reply transaction {expected_id} still carries the request marker"
        )));
    }
    if header.info != InfoCode::Success {
        return Ok(DecodedReply {
            info: header.info,
            data: Vec::new(),
        });
    }
    if header.words != expected_words {
        return Err(WireError::HeaderMismatch(format!(
            "reply word count {} does not match request {expected_words}",
            header.words
        )));
    }
    let n = reply_data_words(expected_ty, expected_words);
    if buf.remaining() < n * 4 {
        return Err(WireError::InvalidPacket("truncated reply payload"));
    }
    let data = (0..n).map(|_| buf.get_u32_le()).collect();
    Ok(DecodedReply {
        info: InfoCode::Success,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_roundtrip_both_versions() {
        for version in [ProtocolVersion::V1_3, ProtocolVersion::V2_0] {
            let header = TransactionHeader {
                version,
                id: 0x2A,
                words: 7,
                ty: TransactionType::NonIncWrite,
                info: InfoCode::Request,
            };
            let raw = header.encode().expect("encode");
            assert_eq!(TransactionHeader::decode(raw, version).expect("decode"), header);
        }
    }

    #[test]
    fn header_rejects_wrong_version() {
        let header = TransactionHeader {
            version: ProtocolVersion::V2_0,
            id: 1,
            words: 1,
            ty: TransactionType::Read,
            info: InfoCode::Request,
        };
        let raw = header.encode().expect("encode");
        let err = TransactionHeader::decode(raw, ProtocolVersion::V1_3).unwrap_err();
        assert!(matches!(err, WireError::HeaderMismatch(_)));
    }

    #[test]
    fn header_enforces_word_limit() {
        let header = TransactionHeader {
            version: ProtocolVersion::V2_0,
            id: 1,
            words: 300,
            ty: TransactionType::Read,
            info: InfoCode::Request,
        };
        assert!(matches!(
            header.encode(),
            Err(WireError::TooManyWords { .. })
        ));
    }

    #[test]
    fn read_request_roundtrip() {
        let body = RequestBody::Read {
            addr: 0x1000,
            words: 16,
        };
        let mut buf = BytesMut::new();
        encode_request(&mut buf, ProtocolVersion::V2_0, 5, &body).expect("encode");
        assert_eq!(buf.len(), request_words(&body) * 4);
        let mut cursor = &buf[..];
        let decoded = decode_request(&mut cursor, ProtocolVersion::V2_0).expect("decode");
        assert_eq!(decoded.header.id, 5);
        assert_eq!(decoded.body, body);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn write_request_roundtrip() {
        let body = RequestBody::Write {
            addr: 0x20,
            data: vec![1, 2, 3],
        };
        let mut buf = BytesMut::new();
        encode_request(&mut buf, ProtocolVersion::V2_0, 9, &body).expect("encode");
        let mut cursor = &buf[..];
        let decoded = decode_request(&mut cursor, ProtocolVersion::V2_0).expect("decode");
        assert_eq!(decoded.header.words, 3);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn rmw_bits_request_roundtrip() {
        let body = RequestBody::RmwBits {
            addr: 0x4,
            and: 0x0000_FFFF,
            or: 0xABCD_0000,
        };
        let mut buf = BytesMut::new();
        encode_request(&mut buf, ProtocolVersion::V2_0, 2, &body).expect("encode");
        let mut cursor = &buf[..];
        let decoded = decode_request(&mut cursor, ProtocolVersion::V2_0).expect("decode");
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn reply_roundtrip_with_data() {
        let mut buf = BytesMut::new();
        encode_reply(
            &mut buf,
            ProtocolVersion::V2_0,
            3,
            TransactionType::Read,
            InfoCode::Success,
            2,
            &[0xAAAA_5555, 0x5555_AAAA],
        )
        .expect("encode");
        let mut cursor = &buf[..];
        let reply = decode_reply(&mut cursor, ProtocolVersion::V2_0, 3, TransactionType::Read, 2)
            .expect("decode");
        assert_eq!(reply.info, InfoCode::Success);
        assert_eq!(reply.data, vec![0xAAAA_5555, 0x5555_AAAA]);
    }

    #[test]
    fn reply_device_error_carries_no_data() {
        let mut buf = BytesMut::new();
        encode_reply(
            &mut buf,
            ProtocolVersion::V2_0,
            3,
            TransactionType::Read,
            InfoCode::BusReadError,
            0,
            &[],
        )
        .expect("encode");
        let mut cursor = &buf[..];
        let reply = decode_reply(&mut cursor, ProtocolVersion::V2_0, 3, TransactionType::Read, 2)
            .expect("decode");
        assert_eq!(reply.info, InfoCode::BusReadError);
        assert!(reply.data.is_empty());
    }

    #[test]
    fn reply_id_mismatch_is_validation_error() {
        let mut buf = BytesMut::new();
        encode_reply(
            &mut buf,
            ProtocolVersion::V2_0,
            4,
            TransactionType::Write,
            InfoCode::Success,
            1,
            &[],
        )
        .expect("encode");
        let mut cursor = &buf[..];
        let err = decode_reply(&mut cursor, ProtocolVersion::V2_0, 3, TransactionType::Write, 1)
            .unwrap_err();
        assert!(matches!(err, WireError::HeaderMismatch(_)));
    }
}
