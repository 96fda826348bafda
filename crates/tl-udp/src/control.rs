//! The reliable control transport.
//!
//! One transport owns one UDP socket and the packet-id sequence of the link.
//! Version 2.0 links negotiate MTU, window size and the starting packet id
//! through a status exchange before any control traffic, and recover lost
//! packets through status probes plus retransmission or resend requests.
//! Version 1.3 links have no status protocol; the transport falls back to
//! stop-and-wait with whole-packet retransmission.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fastrand::Rng;
use ipbus_wire::{
    decode_status_reply, encode_resend_request, encode_status_request, PacketHeader, PacketType,
    ProtocolVersion, StatusReply, STATUS_PACKET_ID,
};
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::stats::TransportStats;
use crate::UdpError;

/// Default bound on a single packet round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Consecutive failed recovery rounds before the link is declared dead.
pub const MAX_RETRIES: usize = 4;

/// Packet size assumed until a status exchange reports the device's MTU.
const DEFAULT_MTU: usize = 1500;
/// In-flight control window assumed until negotiated.
const DEFAULT_WINDOW: usize = 4;
/// Receive buffer, comfortably above any jumbo-frame control packet.
const RECV_BUFFER: usize = 1 << 16;
/// Base delay between recovery rounds.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(20);
/// Upper bound for the random jitter added to the retry delay (inclusive).
const RETRY_JITTER: Duration = Duration::from_millis(10);

/// Link lifecycle. The transient window-full and recovering conditions of a
/// dispatch live inside [`UdpTransport::exchange`]; only the durable states
/// are kept across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// No traffic yet; version 2.0 must negotiate before control packets.
    Fresh,
    /// Negotiated (or version 1.3); control traffic may flow.
    Ready,
    /// Recovery exhausted; every further exchange fails immediately.
    Dead,
}

/// One outbound control packet with its assigned id.
struct Flight {
    id: u16,
    bytes: Bytes,
}

/// Reliable UDP control transport to a single device.
pub struct UdpTransport {
    remote: SocketAddr,
    version: ProtocolVersion,
    socket: Option<UdpSocket>,
    state: LinkState,
    next_id: u16,
    timeout: Duration,
    max_retries: usize,
    window: usize,
    mtu: usize,
    rng: Rng,
    stats: TransportStats,
}

impl UdpTransport {
    pub fn new(remote: SocketAddr, version: ProtocolVersion) -> Self {
        Self {
            remote,
            version,
            socket: None,
            state: LinkState::Fresh,
            next_id: 1,
            timeout: DEFAULT_TIMEOUT,
            max_retries: MAX_RETRIES,
            window: match version {
                ProtocolVersion::V2_0 => DEFAULT_WINDOW,
                ProtocolVersion::V1_3 => 1,
            },
            mtu: DEFAULT_MTU,
            rng: Rng::new(),
            stats: TransportStats::new(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// 32-bit words available for transactions in one control packet.
    pub fn packet_capacity_words(&self) -> usize {
        let words = self.mtu / 4;
        if self.version.has_packet_header() {
            words - 1
        } else {
            words
        }
    }

    /// Bind the socket and run the status negotiation if the link is fresh.
    ///
    /// Callers pack against [`UdpTransport::packet_capacity_words`], so this
    /// runs before packing rather than lazily inside the exchange.
    pub async fn ensure_ready(&mut self) -> Result<(), UdpError> {
        if self.state == LinkState::Dead {
            return Err(self.dead_error(0));
        }
        self.ensure_socket().await?;
        if self.state == LinkState::Fresh {
            match self.version {
                ProtocolVersion::V2_0 => self.negotiate().await?,
                ProtocolVersion::V1_3 => self.state = LinkState::Ready,
            }
        }
        Ok(())
    }

    /// Send the batch of control packets and collect one reply per packet,
    /// in order, recovering lost packets on the way.
    pub async fn exchange(&mut self, packets: Vec<BytesMut>) -> Result<Vec<Bytes>, UdpError> {
        if packets.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;

        let flights: Vec<Flight> = packets
            .into_iter()
            .map(|packet| self.frame(packet))
            .collect();
        let total = flights.len();
        let mut replies: Vec<Option<Bytes>> = (0..total).map(|_| None).collect();
        let mut oldest = 0usize;
        let mut sent = 0usize;
        let mut rounds = 0usize;

        while oldest < total {
            while sent < total && sent - oldest < self.window {
                trace!(id = flights[sent].id, bytes = flights[sent].bytes.len(), "sending control packet");
                self.socket().send(&flights[sent].bytes).await?;
                sent += 1;
            }
            if sent - oldest >= self.window && sent < total {
                debug!(window = self.window, "control window full, waiting for replies");
            }
            match self.await_reply(&flights, &mut replies, oldest, sent).await? {
                WaitOutcome::Stored => {
                    while oldest < total && replies[oldest].is_some() {
                        oldest += 1;
                    }
                    rounds = 0;
                }
                WaitOutcome::Timeout | WaitOutcome::Stray => {
                    rounds += 1;
                    if rounds > self.max_retries {
                        self.state = LinkState::Dead;
                        warn!(remote = %self.remote, rounds, "recovery exhausted, link is dead");
                        return Err(self.dead_error(rounds));
                    }
                    self.backoff(rounds).await;
                    self.recover(&flights, &replies, oldest, sent).await?;
                }
            }
        }
        Ok(replies.into_iter().flatten().collect())
    }

    fn socket(&self) -> &UdpSocket {
        // ensure_ready ran first on every path that reaches here.
        self.socket.as_ref().unwrap_or_else(|| unreachable!("socket bound in ensure_ready"))
    }

    fn dead_error(&self, rounds: usize) -> UdpError {
        UdpError::Dead {
            remote: self.remote,
            rounds,
        }
    }

    async fn ensure_socket(&mut self) -> Result<(), UdpError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let local: SocketAddr = match self.remote.ip() {
            IpAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
            IpAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.remote).await?;
        info!(remote = %self.remote, version = %self.version, "control socket bound");
        self.socket = Some(socket);
        Ok(())
    }

    fn take_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = if self.next_id == u16::MAX {
            1
        } else {
            self.next_id + 1
        };
        id
    }

    /// Stamp the packet id into the header (version 2.0) and freeze.
    fn frame(&mut self, mut packet: BytesMut) -> Flight {
        match self.version {
            ProtocolVersion::V2_0 => {
                let id = self.take_id();
                let header = PacketHeader::new(PacketType::Control, id).encode();
                packet[0..4].copy_from_slice(&header.to_le_bytes());
                Flight {
                    id,
                    bytes: packet.freeze(),
                }
            }
            ProtocolVersion::V1_3 => Flight {
                id: 0,
                bytes: packet.freeze(),
            },
        }
    }

    async fn negotiate(&mut self) -> Result<(), UdpError> {
        for attempt in 1..=self.max_retries {
            self.stats.record_status_probe();
            self.socket().send(&encode_status_request()).await?;
            match self.await_status().await? {
                Some(status) => {
                    self.mtu = (status.mtu as usize).clamp(64, RECV_BUFFER);
                    self.window = (status.buffers as usize).max(1);
                    self.next_id = if status.next_id == STATUS_PACKET_ID {
                        1
                    } else {
                        status.next_id
                    };
                    self.state = LinkState::Ready;
                    info!(
                        remote = %self.remote,
                        mtu = self.mtu,
                        window = self.window,
                        next_id = self.next_id,
                        "status negotiation complete"
                    );
                    return Ok(());
                }
                None => {
                    warn!(remote = %self.remote, attempt, "status negotiation timed out");
                    self.backoff(attempt).await;
                }
            }
        }
        self.state = LinkState::Dead;
        Err(self.dead_error(self.max_retries))
    }

    /// One recovery round: probe the device and redistribute the unanswered
    /// packets. A probe timeout leaves the round unproductive; the caller
    /// counts those and declares the link dead.
    async fn recover(
        &mut self,
        flights: &[Flight],
        replies: &[Option<Bytes>],
        oldest: usize,
        sent: usize,
    ) -> Result<(), UdpError> {
        match self.version {
            ProtocolVersion::V1_3 => {
                // No status protocol: retransmit the oldest outstanding packet.
                self.stats.record_retransmit();
                debug!("retransmitting request packet");
                self.socket().send(&flights[oldest].bytes).await?;
                Ok(())
            }
            ProtocolVersion::V2_0 => {
                self.stats.record_status_probe();
                debug!(remote = %self.remote, "probing device status for recovery");
                self.socket().send(&encode_status_request()).await?;
                let Some(status) = self.await_status().await? else {
                    warn!(remote = %self.remote, "status probe timed out");
                    return Ok(());
                };
                for index in oldest..sent {
                    if replies[index].is_some() {
                        continue;
                    }
                    let flight = &flights[index];
                    if device_has_seen(&status, flight.id) {
                        // The request arrived; its reply was lost.
                        self.stats.record_resend_request();
                        debug!(id = flight.id, "requesting resend of lost reply");
                        self.socket().send(&encode_resend_request(flight.id)).await?;
                    } else {
                        self.stats.record_retransmit();
                        debug!(id = flight.id, "retransmitting lost control packet");
                        self.socket().send(&flight.bytes).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Wait for the next useful control reply, dropping duplicates and
    /// non-control frames.
    async fn await_reply(
        &mut self,
        flights: &[Flight],
        replies: &mut [Option<Bytes>],
        oldest: usize,
        sent: usize,
    ) -> Result<WaitOutcome, UdpError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(WaitOutcome::Timeout);
            }
            let len = match time::timeout(remaining, self.socket().recv(&mut buf)).await {
                Err(_) => return Ok(WaitOutcome::Timeout),
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(len)) => len,
            };
            match self.version {
                ProtocolVersion::V1_3 => {
                    // Headerless stream: the link is stop-and-wait, so this
                    // datagram answers the oldest outstanding packet.
                    replies[oldest] = Some(Bytes::copy_from_slice(&buf[..len]));
                    return Ok(WaitOutcome::Stored);
                }
                ProtocolVersion::V2_0 => {
                    if len < 4 {
                        warn!(bytes = len, "runt datagram dropped");
                        continue;
                    }
                    let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    let header = match PacketHeader::decode(raw) {
                        Ok(header) => header,
                        Err(err) => {
                            warn!(%err, "undecodable packet header dropped");
                            continue;
                        }
                    };
                    if header.ty != PacketType::Control {
                        trace!(ty = ?header.ty, "ignoring non-control frame");
                        continue;
                    }
                    let position = flights[oldest..sent]
                        .iter()
                        .position(|flight| flight.id == header.id);
                    match position {
                        Some(offset) if replies[oldest + offset].is_none() => {
                            trace!(id = header.id, bytes = len, "control reply received");
                            replies[oldest + offset] = Some(Bytes::copy_from_slice(&buf[..len]));
                            return Ok(WaitOutcome::Stored);
                        }
                        Some(_) => {
                            self.stats.record_duplicate();
                            debug!(id = header.id, "duplicate reply dropped");
                        }
                        None => {
                            self.stats.record_stray();
                            warn!(id = header.id, "reply outside the current window, probing");
                            return Ok(WaitOutcome::Stray);
                        }
                    }
                }
            }
        }
    }

    /// Wait for a status reply, ignoring any late control traffic.
    async fn await_status(&mut self) -> Result<Option<StatusReply>, UdpError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let len = match time::timeout(remaining, self.socket().recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(len)) => len,
            };
            match decode_status_reply(&buf[..len]) {
                Ok(status) => {
                    trace!(mtu = status.mtu, buffers = status.buffers, "status reply received");
                    return Ok(Some(status));
                }
                Err(_) => {
                    trace!(bytes = len, "ignoring non-status frame while probing");
                    continue;
                }
            }
        }
    }

    async fn backoff(&mut self, attempt: usize) {
        let multiplier = 1u32 << (attempt.saturating_sub(1)).min(3);
        let base_ms = RETRY_BASE_DELAY.as_millis() as u64;
        let base = Duration::from_millis(base_ms.saturating_mul(multiplier as u64));
        let jitter = Duration::from_millis(self.rng.u64(..=RETRY_JITTER.as_millis() as u64));
        let delay = base + jitter;
        debug!(attempt, ?delay, "recovery backoff");
        time::sleep(delay).await;
    }
}

/// Whether the status reply shows the device has received this packet id,
/// either in its trace of recent headers or implied by the id it expects
/// next (wrap-aware, bounded horizon).
fn device_has_seen(status: &StatusReply, id: u16) -> bool {
    if status.seen_ids().any(|seen| seen == id) {
        return true;
    }
    let distance = status.next_id.wrapping_sub(id);
    distance > 0 && distance < 0x4000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    /// A new reply was stored.
    Stored,
    /// Nothing useful arrived within the timeout.
    Timeout,
    /// A reply outside the window arrived; the link needs a probe.
    Stray,
}
