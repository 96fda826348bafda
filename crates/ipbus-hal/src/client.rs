//! The client transaction engine.
//!
//! Queueing is synchronous and never touches the network; [`Client::dispatch`]
//! is the only suspension point. A dispatch drains the queue, splits each
//! logical transaction into wire chunks within the word-count limit, fills
//! control packets up to the negotiated capacity, runs them through the
//! transport and settles every deferred value in submission order.

use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use ipbus_wire::{
    decode_reply, encode_request, reply_words, request_words, InfoCode, PacketHeader, PacketType,
    ProtocolVersion, RequestBody, TransactionHeader, TransactionType,
};
use regmap_core::{place_masked, NOMASK};
use tl_pcie::PcieTransport;
use tl_udp::UdpTransport;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::val::{Slot, ValHeader, ValVector, ValWord};
use crate::{HalError, Uri};

/// One queued logical request.
struct Transaction {
    kind: TxKind,
    slot: Arc<Slot>,
}

enum TxKind {
    Read { addr: u32, words: u32 },
    NonIncRead { addr: u32, words: u32 },
    ConfigRead { addr: u32, words: u32 },
    Write { addr: u32, data: Vec<u32> },
    NonIncWrite { addr: u32, data: Vec<u32> },
    ConfigWrite { addr: u32, data: Vec<u32> },
    RmwBits { addr: u32, and: u32, or: u32 },
    RmwSum { addr: u32, addend: u32 },
}

/// The transport behind a client.
pub enum Transport {
    Udp(UdpTransport),
    Pcie(PcieTransport),
}

impl Transport {
    async fn ensure_ready(&mut self) -> Result<(), HalError> {
        match self {
            Transport::Udp(udp) => udp.ensure_ready().await.map_err(Into::into),
            Transport::Pcie(pcie) => pcie.ensure_ready().await.map_err(Into::into),
        }
    }

    fn packet_capacity_words(&self) -> usize {
        match self {
            Transport::Udp(udp) => udp.packet_capacity_words(),
            Transport::Pcie(pcie) => pcie.packet_capacity_words(),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        match self {
            Transport::Udp(udp) => udp.set_timeout(timeout),
            Transport::Pcie(pcie) => pcie.set_timeout(timeout),
        }
    }

    async fn exchange(&mut self, packets: Vec<BytesMut>) -> Result<Vec<Bytes>, HalError> {
        match self {
            Transport::Udp(udp) => udp.exchange(packets).await.map_err(Into::into),
            Transport::Pcie(pcie) => pcie.exchange(packets).await.map_err(Into::into),
        }
    }
}

/// Batched, deferred access to one device.
///
/// A client is not meant for concurrent use: one dispatch at a time, with
/// queueing from the same task. Independent clients run in parallel freely.
pub struct Client {
    id: String,
    uri: Uri,
    version: ProtocolVersion,
    queue: Mutex<Vec<Transaction>>,
    transport: AsyncMutex<Transport>,
    timeout: Mutex<Duration>,
}

impl Client {
    pub fn new(id: &str, uri: Uri, version: ProtocolVersion, transport: Transport) -> Self {
        Self {
            id: id.to_string(),
            uri,
            version,
            queue: Mutex::new(Vec::new()),
            transport: AsyncMutex::new(transport),
            timeout: Mutex::new(tl_udp::DEFAULT_TIMEOUT),
        }
    }

    /// Build a client from a connection URI.
    pub fn from_uri(id: &str, uri: Uri) -> Result<Self, HalError> {
        let (version, transport) = match uri.protocol.as_str() {
            "ipbusudp-2.0" => (
                ProtocolVersion::V2_0,
                Transport::Udp(UdpTransport::new(resolve(&uri)?, ProtocolVersion::V2_0)),
            ),
            "ipbusudp-1.3" => (
                ProtocolVersion::V1_3,
                Transport::Udp(UdpTransport::new(resolve(&uri)?, ProtocolVersion::V1_3)),
            ),
            "ipbuspcie-2.0" => (
                ProtocolVersion::V2_0,
                Transport::Pcie(PcieTransport::from_uri_path(&uri.path)?),
            ),
            other => return Err(HalError::UnsupportedProtocol(other.to_string())),
        };
        Ok(Self::new(id, uri, version, transport))
    }

    /// The connection's logical name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The URI this client was built from.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Wall-clock bound on a single packet round trip.
    pub fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    fn enqueue(&self, kind: TxKind) -> Arc<Slot> {
        let slot = Arc::new(Slot::default());
        lock(&self.queue).push(Transaction {
            kind,
            slot: Arc::clone(&slot),
        });
        slot
    }

    /// Queue a single-word read.
    pub fn read(&self, addr: u32) -> ValWord {
        self.read_masked(addr, NOMASK)
    }

    /// Queue a single-word read; the returned value aligns under `mask`.
    pub fn read_masked(&self, addr: u32, mask: u32) -> ValWord {
        let slot = self.enqueue(TxKind::Read { addr, words: 1 });
        ValWord::new(slot, mask)
    }

    /// Queue an incrementing block read.
    pub fn read_block(&self, addr: u32, words: u32) -> ValVector {
        ValVector::new(self.enqueue(TxKind::Read { addr, words }))
    }

    /// Queue a fixed-address (port) block read.
    pub fn read_block_non_inc(&self, addr: u32, words: u32) -> ValVector {
        ValVector::new(self.enqueue(TxKind::NonIncRead { addr, words }))
    }

    /// Queue a read from the configuration address space.
    pub fn read_config(&self, addr: u32, words: u32) -> ValVector {
        ValVector::new(self.enqueue(TxKind::ConfigRead { addr, words }))
    }

    /// Queue a single-word write.
    pub fn write(&self, addr: u32, value: u32) -> ValHeader {
        ValHeader::new(self.enqueue(TxKind::Write {
            addr,
            data: vec![value],
        }))
    }

    /// Queue an incrementing block write.
    pub fn write_block(&self, addr: u32, data: Vec<u32>) -> ValHeader {
        ValHeader::new(self.enqueue(TxKind::Write { addr, data }))
    }

    /// Queue a fixed-address (port) block write.
    pub fn write_block_non_inc(&self, addr: u32, data: Vec<u32>) -> ValHeader {
        ValHeader::new(self.enqueue(TxKind::NonIncWrite { addr, data }))
    }

    /// Queue a write to the configuration address space.
    pub fn write_config(&self, addr: u32, data: Vec<u32>) -> ValHeader {
        ValHeader::new(self.enqueue(TxKind::ConfigWrite { addr, data }))
    }

    /// Queue a masked write, packed as read-modify-write against the mask.
    /// The returned word observes the register value before modification.
    pub fn write_masked(&self, addr: u32, value: u32, mask: u32) -> ValWord {
        self.rmw_bits(addr, !mask, place_masked(value, mask))
            .with_mask(mask)
    }

    /// Queue a read-modify-write with AND and OR terms. Observes the value
    /// before modification.
    pub fn rmw_bits(&self, addr: u32, and: u32, or: u32) -> ValWord {
        ValWord::new(self.enqueue(TxKind::RmwBits { addr, and, or }), NOMASK)
    }

    /// Queue a read-modify-write adding `addend`. Observes the value before
    /// modification.
    pub fn rmw_sum(&self, addr: u32, addend: u32) -> ValWord {
        ValWord::new(self.enqueue(TxKind::RmwSum { addr, addend }), NOMASK)
    }

    /// Flush the pending queue. Returns once every queued transaction is
    /// settled; the first fatal transport or protocol error fails the whole
    /// batch and propagates. Device-reported per-transaction errors fail
    /// only their own value.
    pub async fn dispatch(&self) -> Result<(), HalError> {
        let batch = std::mem::take(&mut *lock(&self.queue));
        if batch.is_empty() {
            trace!(id = %self.id, "dispatch with empty queue");
            return Ok(());
        }

        let mut transport = self.transport.lock().await;
        transport.set_timeout(self.timeout());
        if let Err(err) = transport.ensure_ready().await {
            fail_batch(&batch, &err);
            return Err(err);
        }
        let capacity = transport.packet_capacity_words();
        let plan = match pack(&batch, self.version, capacity) {
            Ok(plan) => plan,
            Err(err) => {
                fail_batch(&batch, &err);
                return Err(err);
            }
        };
        debug!(
            id = %self.id,
            transactions = batch.len(),
            packets = plan.packets.len(),
            "dispatching"
        );
        let replies = match transport.exchange(plan.packets).await {
            Ok(replies) => replies,
            Err(err) => {
                fail_batch(&batch, &err);
                return Err(err);
            }
        };
        drop(transport);

        let result = unpack(&batch, &plan.expectations, &replies, self.version);
        if let Err(err) = &result {
            fail_batch(&batch, err);
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn resolve(uri: &Uri) -> Result<std::net::SocketAddr, HalError> {
    let port: u16 = uri
        .port
        .parse()
        .map_err(|_| HalError::Resolve(format!("{}:{}", uri.hostname, uri.port)))?;
    (uri.hostname.as_str(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| HalError::Resolve(format!("{}:{}", uri.hostname, uri.port)))
}

/// Fail every still-pending reservation of the batch.
fn fail_batch(batch: &[Transaction], err: &HalError) {
    for transaction in batch {
        if !transaction.slot.is_settled() {
            transaction.slot.fail(err.to_string());
        }
    }
}

/// One expected reply chunk within a packet.
struct Expectation {
    txn_id: u16,
    ty: TransactionType,
    words: u16,
    /// Index of the logical transaction this chunk belongs to.
    target: usize,
}

struct Plan {
    packets: Vec<BytesMut>,
    expectations: Vec<Vec<Expectation>>,
}

struct Packer {
    version: ProtocolVersion,
    /// Transaction words available per packet (packet header excluded).
    budget: usize,
    packets: Vec<BytesMut>,
    expectations: Vec<Vec<Expectation>>,
    current: BytesMut,
    current_expect: Vec<Expectation>,
    used_request: usize,
    used_reply: usize,
    txn_id: u16,
}

impl Packer {
    fn new(version: ProtocolVersion, budget: usize) -> Self {
        let mut packer = Self {
            version,
            budget,
            packets: Vec::new(),
            expectations: Vec::new(),
            current: BytesMut::new(),
            current_expect: Vec::new(),
            used_request: 0,
            used_reply: 0,
            txn_id: 0,
        };
        packer.start_packet();
        packer
    }

    fn start_packet(&mut self) {
        self.current = BytesMut::new();
        if self.version.has_packet_header() {
            // Placeholder id; the transport stamps the real one.
            PacketHeader::new(PacketType::Control, 0).put(&mut self.current);
        }
        self.current_expect = Vec::new();
        self.used_request = 0;
        self.used_reply = 0;
    }

    fn finish_packet(&mut self) {
        if self.current_expect.is_empty() {
            return;
        }
        self.packets.push(std::mem::take(&mut self.current));
        self.expectations
            .push(std::mem::take(&mut self.current_expect));
        self.start_packet();
    }

    fn take_txn_id(&mut self) -> u16 {
        let id = self.txn_id;
        self.txn_id = if id == TransactionHeader::max_id(self.version) {
            0
        } else {
            id + 1
        };
        id
    }

    fn push(&mut self, target: usize, body: RequestBody) -> Result<(), HalError> {
        let request = request_words(&body);
        let reply = reply_words(body.ty(), body.header_words());
        if self.used_request + request > self.budget || self.used_reply + reply > self.budget {
            self.finish_packet();
        }
        let txn_id = self.take_txn_id();
        let expectation = Expectation {
            txn_id,
            ty: body.ty(),
            words: body.header_words(),
            target,
        };
        encode_request(&mut self.current, self.version, txn_id, &body)?;
        self.current_expect.push(expectation);
        self.used_request += request;
        self.used_reply += reply;
        Ok(())
    }

    fn finish(mut self) -> Plan {
        self.finish_packet();
        Plan {
            packets: self.packets,
            expectations: self.expectations,
        }
    }
}

/// Split the batch into chunked request transactions and fill packets.
fn pack(batch: &[Transaction], version: ProtocolVersion, capacity: usize) -> Result<Plan, HalError> {
    // A chunk needs its header and address words in the request, and for
    // reads its data has to fit the reply packet alongside a reply header.
    let max_chunk = version
        .max_block_words()
        .min(capacity.saturating_sub(2)) as u32;
    let mut packer = Packer::new(version, capacity);
    for (target, transaction) in batch.iter().enumerate() {
        match &transaction.kind {
            TxKind::Read { addr, words } => {
                for (chunk_addr, chunk) in chunk_span(*addr, *words, max_chunk, true) {
                    packer.push(
                        target,
                        RequestBody::Read {
                            addr: chunk_addr,
                            words: chunk,
                        },
                    )?;
                }
            }
            TxKind::NonIncRead { addr, words } => {
                for (chunk_addr, chunk) in chunk_span(*addr, *words, max_chunk, false) {
                    packer.push(
                        target,
                        RequestBody::NonIncRead {
                            addr: chunk_addr,
                            words: chunk,
                        },
                    )?;
                }
            }
            TxKind::ConfigRead { addr, words } => {
                for (chunk_addr, chunk) in chunk_span(*addr, *words, max_chunk, true) {
                    packer.push(
                        target,
                        RequestBody::ConfigRead {
                            addr: chunk_addr,
                            words: chunk,
                        },
                    )?;
                }
            }
            TxKind::Write { addr, data } => {
                for (chunk_addr, slice) in chunk_data(*addr, data, max_chunk, true) {
                    packer.push(
                        target,
                        RequestBody::Write {
                            addr: chunk_addr,
                            data: slice.to_vec(),
                        },
                    )?;
                }
            }
            TxKind::NonIncWrite { addr, data } => {
                for (chunk_addr, slice) in chunk_data(*addr, data, max_chunk, false) {
                    packer.push(
                        target,
                        RequestBody::NonIncWrite {
                            addr: chunk_addr,
                            data: slice.to_vec(),
                        },
                    )?;
                }
            }
            TxKind::ConfigWrite { addr, data } => {
                for (chunk_addr, slice) in chunk_data(*addr, data, max_chunk, true) {
                    packer.push(
                        target,
                        RequestBody::ConfigWrite {
                            addr: chunk_addr,
                            data: slice.to_vec(),
                        },
                    )?;
                }
            }
            TxKind::RmwBits { addr, and, or } => {
                packer.push(
                    target,
                    RequestBody::RmwBits {
                        addr: *addr,
                        and: *and,
                        or: *or,
                    },
                )?;
            }
            TxKind::RmwSum { addr, addend } => {
                packer.push(
                    target,
                    RequestBody::RmwSum {
                        addr: *addr,
                        addend: *addend,
                    },
                )?;
            }
        }
    }
    Ok(packer.finish())
}

/// Word spans of at most `max_chunk`, advancing the address when the
/// transfer is incremental.
fn chunk_span(addr: u32, words: u32, max_chunk: u32, incremental: bool) -> Vec<(u32, u16)> {
    let mut chunks = Vec::new();
    let mut offset = 0u32;
    while offset < words {
        let chunk = (words - offset).min(max_chunk);
        let chunk_addr = if incremental { addr.wrapping_add(offset) } else { addr };
        chunks.push((chunk_addr, chunk as u16));
        offset += chunk;
    }
    chunks
}

/// Data slices of at most `max_chunk` words.
fn chunk_data(addr: u32, data: &[u32], max_chunk: u32, incremental: bool) -> Vec<(u32, &[u32])> {
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let chunk = (data.len() - offset).min(max_chunk as usize);
        let chunk_addr = if incremental {
            addr.wrapping_add(offset as u32)
        } else {
            addr
        };
        chunks.push((chunk_addr, &data[offset..offset + chunk]));
        offset += chunk;
    }
    chunks
}

/// Decode every reply packet and settle the batch in submission order.
fn unpack(
    batch: &[Transaction],
    expectations: &[Vec<Expectation>],
    replies: &[Bytes],
    version: ProtocolVersion,
) -> Result<(), HalError> {
    let mut staging: Vec<Vec<u32>> = batch.iter().map(|_| Vec::new()).collect();
    let mut remaining: Vec<usize> = vec![0; batch.len()];
    let mut failure: Vec<Option<String>> = batch.iter().map(|_| None).collect();
    for packet in expectations {
        for expectation in packet {
            remaining[expectation.target] += 1;
        }
    }
    // Zero-length transfers have no wire chunks and settle immediately.
    for (target, transaction) in batch.iter().enumerate() {
        if remaining[target] == 0 {
            transaction.slot.complete(Vec::new());
        }
    }

    if replies.len() != expectations.len() {
        return Err(HalError::MissingReplies {
            expected: expectations.len(),
            received: replies.len(),
        });
    }

    for (frame, packet_expectations) in replies.iter().zip(expectations) {
        let mut cursor = &frame[..];
        if version.has_packet_header() {
            let header = PacketHeader::get(&mut cursor).map_err(HalError::from)?;
            if header.ty != PacketType::Control {
                return Err(HalError::Wire(ipbus_wire::WireError::HeaderMismatch(
                    format!("reply packet {} is not a control packet", header.id),
                )));
            }
        }
        for expectation in packet_expectations {
            let reply = decode_reply(
                &mut cursor,
                version,
                expectation.txn_id,
                expectation.ty,
                expectation.words,
            )?;
            let target = expectation.target;
            if reply.info == InfoCode::Success {
                if failure[target].is_none() {
                    staging[target].extend_from_slice(&reply.data);
                }
            } else if failure[target].is_none() {
                failure[target] = Some(format!(
                    "device reported {:?} at transaction {}",
                    reply.info, expectation.txn_id
                ));
            }
            remaining[target] -= 1;
            if remaining[target] == 0 {
                match failure[target].take() {
                    Some(reason) => {
                        warn!(transaction = target, %reason, "transaction failed on the device");
                        batch[target].slot.fail(reason);
                    }
                    None => batch[target].slot.complete(std::mem::take(&mut staging[target])),
                }
            }
        }
        if cursor.has_remaining() {
            warn!(bytes = cursor.remaining(), "trailing bytes in reply packet");
        }
    }
    Ok(())
}
