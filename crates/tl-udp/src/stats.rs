//! Transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Reliability counters of one UDP transport.
#[derive(Debug, Default)]
pub struct TransportStats {
    status_probes: AtomicU64,
    retransmits: AtomicU64,
    resend_requests: AtomicU64,
    duplicate_replies: AtomicU64,
    stray_replies: AtomicU64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status request put on the wire.
    pub fn record_status_probe(&self) {
        self.status_probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a control packet retransmitted after loss.
    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resend request for a lost reply.
    pub fn record_resend_request(&self) {
        self.resend_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate reply that was dropped.
    pub fn record_duplicate(&self) {
        self.duplicate_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reply outside the current window that was dropped.
    pub fn record_stray(&self) {
        self.stray_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counters.
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            status_probes: self.status_probes.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            resend_requests: self.resend_requests.load(Ordering::Relaxed),
            duplicate_replies: self.duplicate_replies.load(Ordering::Relaxed),
            stray_replies: self.stray_replies.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of collected counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub status_probes: u64,
    pub retransmits: u64,
    pub resend_requests: u64,
    pub duplicate_replies: u64,
    pub stray_replies: u64,
}
