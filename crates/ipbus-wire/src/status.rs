//! Status and resend packets (version 2.0 negotiation and loss recovery).
//!
//! A status packet is a fixed 16-word frame. The request carries zeros after
//! the header; the reply reports the device's MTU, its reply-buffer count,
//! the control packet id it expects next, and a short trace of the most
//! recently received control-packet headers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PacketHeader, PacketType, WireError, STATUS_PACKET_ID};

/// Total size of a status packet in 32-bit words.
pub const STATUS_WORDS: usize = 16;

/// Number of received-header trace entries in a status reply.
pub const STATUS_TRACE_DEPTH: usize = 4;

const MTU_WORD: usize = 1;
const BUFFERS_WORD: usize = 2;
const NEXT_HEADER_WORD: usize = 3;
const TRACE_WORD: usize = 4;

/// Decoded status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    /// Largest packet the device accepts, in bytes.
    pub mtu: u32,
    /// Number of reply buffers, i.e. the in-flight control window.
    pub buffers: u32,
    /// Packet id the device expects on the next control packet.
    pub next_id: u16,
    /// Raw headers of recently received control packets, most recent first.
    pub trace: [u32; STATUS_TRACE_DEPTH],
}

impl StatusReply {
    /// Packet ids present in the received-header trace.
    pub fn seen_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.trace
            .iter()
            .filter(|raw| **raw != 0)
            .filter_map(|raw| PacketHeader::decode(*raw).ok())
            .map(|header| header.id)
    }
}

/// Encode a status request frame.
pub fn encode_status_request() -> Bytes {
    let mut buf = BytesMut::with_capacity(STATUS_WORDS * 4);
    PacketHeader::new(PacketType::Status, STATUS_PACKET_ID).put(&mut buf);
    for _ in 1..STATUS_WORDS {
        buf.put_u32_le(0);
    }
    buf.freeze()
}

/// Encode a status reply frame (device side).
pub fn encode_status_reply(reply: &StatusReply) -> Bytes {
    let mut words = [0u32; STATUS_WORDS];
    words[0] = PacketHeader::new(PacketType::Status, STATUS_PACKET_ID).encode();
    words[MTU_WORD] = reply.mtu;
    words[BUFFERS_WORD] = reply.buffers;
    words[NEXT_HEADER_WORD] = PacketHeader::new(PacketType::Control, reply.next_id).encode();
    words[TRACE_WORD..TRACE_WORD + STATUS_TRACE_DEPTH].copy_from_slice(&reply.trace);
    let mut buf = BytesMut::with_capacity(STATUS_WORDS * 4);
    for word in words {
        buf.put_u32_le(word);
    }
    buf.freeze()
}

/// Decode a status reply frame.
pub fn decode_status_reply(frame: &[u8]) -> Result<StatusReply, WireError> {
    if frame.len() != STATUS_WORDS * 4 {
        return Err(WireError::InvalidPacket("status frame length"));
    }
    let mut cursor = frame;
    let header = PacketHeader::get(&mut cursor)?;
    if header.ty != PacketType::Status || header.id != STATUS_PACKET_ID {
        return Err(WireError::InvalidPacket("not a status frame"));
    }
    let mut words = [0u32; STATUS_WORDS - 1];
    for word in words.iter_mut() {
        *word = cursor.get_u32_le();
    }
    let next = PacketHeader::decode(words[NEXT_HEADER_WORD - 1])?;
    if next.ty != PacketType::Control {
        return Err(WireError::InvalidPacket("status next-id is not a control header"));
    }
    let mut trace = [0u32; STATUS_TRACE_DEPTH];
    trace.copy_from_slice(&words[TRACE_WORD - 1..TRACE_WORD - 1 + STATUS_TRACE_DEPTH]);
    Ok(StatusReply {
        mtu: words[MTU_WORD - 1],
        buffers: words[BUFFERS_WORD - 1],
        next_id: next.id,
        trace,
    })
}

/// Encode a resend request for the control packet with the given id.
pub fn encode_resend_request(id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    PacketHeader::new(PacketType::Resend, id).put(&mut buf);
    buf.freeze()
}
