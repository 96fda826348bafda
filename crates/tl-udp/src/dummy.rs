//! In-process software device speaking the control protocol.
//!
//! Backs the end-to-end test suites and the `dummy` CLI subcommand. The
//! device owns a sparse 32-bit word memory plus a separate configuration
//! space. On a version 2.0 link it answers status probes with its
//! negotiation parameters and a trace of recently received control headers,
//! and caches replies so that resend requests can be honoured; a version
//! 1.3 device answers bare transaction streams. Fault injection knobs
//! simulate packet loss.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use ipbus_wire::{
    decode_request, encode_reply, encode_status_reply, InfoCode, PacketHeader, PacketType,
    ProtocolVersion, RequestBody, StatusReply, STATUS_TRACE_DEPTH,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Receive buffer requested for the device socket.
const DEVICE_RCVBUF: usize = 1 << 20;
/// Largest datagram the device will process.
const MAX_PACKET: usize = 1 << 16;
/// Number of cached replies kept for resend requests.
const REPLY_CACHE_DEPTH: usize = 8;

/// Negotiation parameters advertised by the device.
#[derive(Debug, Clone, Copy)]
pub struct DummyConfig {
    /// Protocol version the device speaks. Version 1.3 devices answer bare
    /// transaction streams and have no status or resend machinery.
    pub version: ProtocolVersion,
    /// MTU reported in status replies, bytes.
    pub mtu: u32,
    /// Reply buffer count reported in status replies (the control window).
    pub buffers: u32,
    /// Address that fails with a bus error when touched, if set.
    pub bus_error_addr: Option<u32>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V2_0,
            mtu: 1500,
            buffers: 4,
            bus_error_addr: None,
        }
    }
}

/// Shared fault-injection switches and counters.
#[derive(Debug, Default)]
struct Shared {
    drop_replies: AtomicU32,
    drop_all: AtomicBool,
    status_requests: AtomicU64,
    resend_requests: AtomicU64,
    control_packets: AtomicU64,
}

/// Handle to a running dummy device.
pub struct DummyHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl DummyHandle {
    /// The address the device listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drop the next `n` control replies (requests are still executed and
    /// the replies cached, as a device whose reply datagrams are lost).
    pub fn drop_next_replies(&self, n: u32) {
        self.shared.drop_replies.store(n, Ordering::SeqCst);
    }

    /// Silently drop every inbound packet while set.
    pub fn set_drop_all(&self, drop: bool) {
        self.shared.drop_all.store(drop, Ordering::SeqCst);
    }

    /// Number of status requests the device has answered.
    pub fn status_requests(&self) -> u64 {
        self.shared.status_requests.load(Ordering::SeqCst)
    }

    /// Number of resend requests the device has received.
    pub fn resend_requests(&self) -> u64 {
        self.shared.resend_requests.load(Ordering::SeqCst)
    }

    /// Number of control packets the device has executed.
    pub fn control_packets(&self) -> u64 {
        self.shared.control_packets.load(Ordering::SeqCst)
    }
}

impl Drop for DummyHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The software device.
pub struct DummyHardware {
    config: DummyConfig,
    memory: HashMap<u32, u32>,
    config_space: HashMap<u32, u32>,
    expected_id: u16,
    trace: VecDeque<u32>,
    reply_cache: VecDeque<(u16, BytesMut)>,
}

impl DummyHardware {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            memory: HashMap::new(),
            config_space: HashMap::new(),
            expected_id: 1,
            trace: VecDeque::with_capacity(STATUS_TRACE_DEPTH),
            reply_cache: VecDeque::with_capacity(REPLY_CACHE_DEPTH),
        }
    }

    /// Bind an ephemeral loopback socket and run the device as a
    /// background task.
    pub async fn spawn(config: DummyConfig) -> std::io::Result<DummyHandle> {
        Self::spawn_on((Ipv4Addr::LOCALHOST, 0).into(), config).await
    }

    /// Bind the given address and run the device as a background task.
    pub async fn spawn_on(bind: SocketAddr, config: DummyConfig) -> std::io::Result<DummyHandle> {
        let domain = if bind.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if let Err(err) = socket.set_recv_buffer_size(DEVICE_RCVBUF) {
            warn!(?err, "failed to set device receive buffer");
        }
        socket.bind(&bind.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let addr = socket.local_addr()?;
        info!(%addr, "dummy hardware listening");

        let shared = Arc::new(Shared::default());
        let task_shared = Arc::clone(&shared);
        let mut device = DummyHardware::new(config);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(%err, "device socket error");
                        continue;
                    }
                };
                if task_shared.drop_all.load(Ordering::SeqCst) {
                    trace!(bytes = len, %src, "dropping inbound packet");
                    continue;
                }
                for frame in device.handle_packet(&buf[..len], &task_shared) {
                    if let Err(err) = socket.send_to(&frame, src).await {
                        warn!(%err, %src, "device reply send failed");
                    }
                }
            }
        });

        Ok(DummyHandle { addr, shared, task })
    }

    /// Process one inbound datagram, returning the frames to send back.
    fn handle_packet(&mut self, data: &[u8], shared: &Shared) -> Vec<BytesMut> {
        if self.config.version == ProtocolVersion::V1_3 {
            return self.handle_headerless(data, shared);
        }
        let mut cursor = data;
        let header = match PacketHeader::get(&mut cursor) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "undecodable packet dropped");
                return Vec::new();
            }
        };
        match header.ty {
            PacketType::Status => {
                shared.status_requests.fetch_add(1, Ordering::SeqCst);
                vec![self.status_reply()]
            }
            PacketType::Resend => {
                shared.resend_requests.fetch_add(1, Ordering::SeqCst);
                debug!(id = header.id, "resend request");
                self.reply_cache
                    .iter()
                    .find(|(id, _)| *id == header.id)
                    .map(|(_, frame)| vec![frame.clone()])
                    .unwrap_or_default()
            }
            PacketType::Control => {
                // A retransmitted request must not be executed twice; the
                // cached reply is authoritative.
                if let Some((_, cached)) = self
                    .reply_cache
                    .iter()
                    .find(|(id, _)| *id == header.id)
                {
                    debug!(id = header.id, "retransmitted request, replaying cached reply");
                    return vec![cached.clone()];
                }
                shared.control_packets.fetch_add(1, Ordering::SeqCst);
                self.record_received(header);
                let reply = self.execute_control(header.id, cursor);
                self.cache_reply(header.id, reply.clone());
                let pending_drops = shared.drop_replies.load(Ordering::SeqCst);
                if pending_drops > 0 {
                    shared.drop_replies.store(pending_drops - 1, Ordering::SeqCst);
                    debug!(id = header.id, "dropping control reply");
                    return Vec::new();
                }
                vec![reply]
            }
        }
    }

    /// Version 1.3 path: a datagram is a bare transaction stream. There is
    /// no packet id and no reply cache, so a retransmitted request is
    /// simply executed again.
    fn handle_headerless(&mut self, data: &[u8], shared: &Shared) -> Vec<BytesMut> {
        shared.control_packets.fetch_add(1, Ordering::SeqCst);
        let mut cursor = data;
        let mut reply = BytesMut::new();
        while cursor.has_remaining() {
            let request = match decode_request(&mut cursor, ProtocolVersion::V1_3) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%err, "malformed transaction, truncating reply");
                    break;
                }
            };
            let id = request.header.id;
            let ty = request.header.ty;
            let words = request.header.words;
            let (info, words, data) = match self.execute(request.body) {
                Ok(data) => (InfoCode::Success, words, data),
                Err(code) => (code, 0, Vec::new()),
            };
            let _ = encode_reply(&mut reply, ProtocolVersion::V1_3, id, ty, info, words, &data);
        }
        let pending_drops = shared.drop_replies.load(Ordering::SeqCst);
        if pending_drops > 0 {
            shared.drop_replies.store(pending_drops - 1, Ordering::SeqCst);
            debug!("dropping headerless reply");
            return Vec::new();
        }
        vec![reply]
    }

    fn status_reply(&self) -> BytesMut {
        let mut trace = [0u32; STATUS_TRACE_DEPTH];
        for (slot, raw) in trace.iter_mut().zip(self.trace.iter()) {
            *slot = *raw;
        }
        let reply = StatusReply {
            mtu: self.config.mtu,
            buffers: self.config.buffers,
            next_id: self.expected_id,
            trace,
        };
        BytesMut::from(&encode_status_reply(&reply)[..])
    }

    fn record_received(&mut self, header: PacketHeader) {
        if self.trace.len() == STATUS_TRACE_DEPTH {
            self.trace.pop_back();
        }
        self.trace.push_front(header.encode());
        self.expected_id = if header.id == u16::MAX { 1 } else { header.id + 1 };
    }

    fn cache_reply(&mut self, id: u16, frame: BytesMut) {
        if self.reply_cache.len() == REPLY_CACHE_DEPTH {
            self.reply_cache.pop_front();
        }
        self.reply_cache.push_back((id, frame));
    }

    /// Execute the transactions of a control packet and build the reply.
    fn execute_control(&mut self, packet_id: u16, mut cursor: &[u8]) -> BytesMut {
        let mut reply = BytesMut::new();
        PacketHeader::new(PacketType::Control, packet_id).put(&mut reply);
        while cursor.has_remaining() {
            let request = match decode_request(&mut cursor, ProtocolVersion::V2_0) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%err, "malformed transaction, truncating reply");
                    break;
                }
            };
            let id = request.header.id;
            let ty = request.header.ty;
            let words = request.header.words;
            match self.execute(request.body) {
                Ok(data) => {
                    // encode_reply only fails on header field overflow, which
                    // the echoed request header already ruled out.
                    let _ = encode_reply(
                        &mut reply,
                        ProtocolVersion::V2_0,
                        id,
                        ty,
                        InfoCode::Success,
                        words,
                        &data,
                    );
                }
                Err(code) => {
                    debug!(transaction = id, ?code, "transaction failed");
                    let _ = encode_reply(
                        &mut reply,
                        ProtocolVersion::V2_0,
                        id,
                        ty,
                        code,
                        0,
                        &[],
                    );
                }
            }
        }
        reply
    }

    fn check_bus(&self, addr: u32, words: u32, write: bool) -> Result<(), InfoCode> {
        if let Some(poison) = self.config.bus_error_addr {
            let range = addr..=addr.saturating_add(words.saturating_sub(1));
            if range.contains(&poison) {
                return Err(if write {
                    InfoCode::BusWriteError
                } else {
                    InfoCode::BusReadError
                });
            }
        }
        Ok(())
    }

    fn execute(&mut self, body: RequestBody) -> Result<Vec<u32>, InfoCode> {
        match body {
            RequestBody::Read { addr, words } => {
                self.check_bus(addr, words as u32, false)?;
                Ok((0..words as u32)
                    .map(|offset| self.load(addr.wrapping_add(offset)))
                    .collect())
            }
            RequestBody::NonIncRead { addr, words } => {
                self.check_bus(addr, 1, false)?;
                // Port access: the address never advances.
                Ok((0..words).map(|_| self.load(addr)).collect())
            }
            RequestBody::Write { addr, data } => {
                self.check_bus(addr, data.len() as u32, true)?;
                for (offset, word) in data.iter().enumerate() {
                    self.memory.insert(addr.wrapping_add(offset as u32), *word);
                }
                Ok(Vec::new())
            }
            RequestBody::NonIncWrite { addr, data } => {
                self.check_bus(addr, 1, true)?;
                for word in data {
                    self.memory.insert(addr, word);
                }
                Ok(Vec::new())
            }
            RequestBody::RmwBits { addr, and, or } => {
                self.check_bus(addr, 1, true)?;
                let old = self.load(addr);
                self.memory.insert(addr, (old & and) | or);
                Ok(vec![old])
            }
            RequestBody::RmwSum { addr, addend } => {
                self.check_bus(addr, 1, true)?;
                let old = self.load(addr);
                self.memory.insert(addr, old.wrapping_add(addend));
                Ok(vec![old])
            }
            RequestBody::ConfigRead { addr, words } => Ok((0..words as u32)
                .map(|offset| {
                    self.config_space
                        .get(&addr.wrapping_add(offset))
                        .copied()
                        .unwrap_or(0)
                })
                .collect()),
            RequestBody::ConfigWrite { addr, data } => {
                for (offset, word) in data.iter().enumerate() {
                    self.config_space
                        .insert(addr.wrapping_add(offset as u32), *word);
                }
                Ok(Vec::new())
            }
        }
    }

    fn load(&self, addr: u32) -> u32 {
        self.memory.get(&addr).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipbus_wire::encode_request;

    fn control_packet(id: u16, bodies: &[RequestBody]) -> BytesMut {
        let mut packet = BytesMut::new();
        PacketHeader::new(PacketType::Control, id).put(&mut packet);
        for (index, body) in bodies.iter().enumerate() {
            encode_request(&mut packet, ProtocolVersion::V2_0, index as u16, body)
                .expect("encode request");
        }
        packet
    }

    fn run(device: &mut DummyHardware, packet: &BytesMut) -> Vec<BytesMut> {
        let shared = Shared::default();
        device.handle_packet(&packet[..], &shared)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut device = DummyHardware::new(DummyConfig::default());
        let write = control_packet(
            1,
            &[RequestBody::Write {
                addr: 0x10,
                data: vec![7, 8, 9],
            }],
        );
        assert_eq!(run(&mut device, &write).len(), 1);
        assert_eq!(device.load(0x10), 7);
        assert_eq!(device.load(0x12), 9);

        let read = control_packet(2, &[RequestBody::Read { addr: 0x10, words: 3 }]);
        let replies = run(&mut device, &read);
        assert_eq!(replies.len(), 1);
        let frame = &replies[0];
        // Packet header, transaction header, then the three data words.
        assert_eq!(frame.len(), 4 * 5);
        let words: Vec<u32> = frame[8..]
            .chunks(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("chunk")))
            .collect();
        assert_eq!(words, vec![7, 8, 9]);
    }

    #[test]
    fn non_incrementing_write_lands_on_one_cell() {
        let mut device = DummyHardware::new(DummyConfig::default());
        let write = control_packet(
            1,
            &[RequestBody::NonIncWrite {
                addr: 0x100,
                data: vec![1, 2, 3, 4],
            }],
        );
        run(&mut device, &write);
        assert_eq!(device.load(0x100), 4);
        assert_eq!(device.load(0x101), 0);
    }

    #[test]
    fn rmw_bits_returns_previous_value() {
        let mut device = DummyHardware::new(DummyConfig::default());
        device.memory.insert(0x4, 0x0000_BEEF);
        let rmw = control_packet(
            1,
            &[RequestBody::RmwBits {
                addr: 0x4,
                and: 0x0000_FFFF,
                or: 0xABCD_0000,
            }],
        );
        let replies = run(&mut device, &rmw);
        let frame = &replies[0];
        let old = u32::from_le_bytes(frame[8..12].try_into().expect("word"));
        assert_eq!(old, 0x0000_BEEF);
        assert_eq!(device.load(0x4), 0xABCD_BEEF);
    }

    #[test]
    fn retransmitted_control_packet_is_not_executed_twice() {
        let mut device = DummyHardware::new(DummyConfig::default());
        let rmw = control_packet(
            7,
            &[RequestBody::RmwSum {
                addr: 0x20,
                addend: 5,
            }],
        );
        let first = run(&mut device, &rmw);
        let second = run(&mut device, &rmw);
        assert_eq!(first, second);
        assert_eq!(device.load(0x20), 5);
    }

    #[test]
    fn status_reports_expected_id_and_trace() {
        let mut device = DummyHardware::new(DummyConfig::default());
        let write = control_packet(3, &[RequestBody::Write { addr: 0, data: vec![1] }]);
        run(&mut device, &write);

        let mut probe = BytesMut::new();
        PacketHeader::new(PacketType::Status, 0).put(&mut probe);
        for _ in 1..ipbus_wire::STATUS_WORDS {
            probe.extend_from_slice(&0u32.to_le_bytes());
        }
        let replies = run(&mut device, &probe);
        let status = ipbus_wire::decode_status_reply(&replies[0][..]).expect("status");
        assert_eq!(status.next_id, 4);
        assert_eq!(status.seen_ids().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn bus_error_fails_only_the_touching_transaction() {
        let mut device = DummyHardware::new(DummyConfig {
            bus_error_addr: Some(0x50),
            ..DummyConfig::default()
        });
        let packet = control_packet(
            1,
            &[
                RequestBody::Write { addr: 0x40, data: vec![1] },
                RequestBody::Read { addr: 0x50, words: 1 },
            ],
        );
        let replies = run(&mut device, &packet);
        let frame = &replies[0];
        // Packet header + write reply header + failed read reply header.
        assert_eq!(frame.len(), 12);
        assert_eq!(device.load(0x40), 1);
    }
}
