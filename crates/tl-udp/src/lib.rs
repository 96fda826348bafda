//! UDP control transport: reliability state machine, loss recovery, and a
//! software device for end-to-end testing.

pub mod control;
pub mod dummy;
pub mod stats;

use std::net::SocketAddr;

use thiserror::Error;

pub use control::{UdpTransport, DEFAULT_TIMEOUT, MAX_RETRIES};
pub use dummy::{DummyConfig, DummyHandle, DummyHardware};
pub use stats::{TransportSnapshot, TransportStats};

/// Errors produced by the UDP control path.
#[derive(Debug, Error)]
pub enum UdpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for a reply from {0}")]
    Timeout(SocketAddr),
    #[error("transport to {remote} is dead after {rounds} failed recovery rounds")]
    Dead { remote: SocketAddr, rounds: usize },
    #[error(transparent)]
    Wire(#[from] ipbus_wire::WireError),
}
