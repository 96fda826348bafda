//! Hardware access facade: connection management, node views, deferred
//! values and batched dispatch over the control transports.

pub mod client;
pub mod connection;
pub mod hw;
pub mod uri;
pub mod val;

use std::path::PathBuf;

use thiserror::Error;

pub use client::{Client, Transport};
pub use connection::ConnectionManager;
pub use hw::{HwInterface, NodeView};
pub use uri::{Uri, UriParseError};
pub use val::{ValHeader, ValVector, ValWord};

pub use ipbus_wire::ProtocolVersion;
pub use regmap_core::{Mode, Node, NodeBuilder, Permission, RegMapError, NOMASK};

/// Error type produced by the hardware access facade.
#[derive(Debug, Error)]
pub enum HalError {
    #[error(transparent)]
    Uri(#[from] UriParseError),
    #[error(transparent)]
    RegMap(#[from] RegMapError),
    #[error(transparent)]
    Wire(#[from] ipbus_wire::WireError),
    #[error(transparent)]
    Udp(#[from] tl_udp::UdpError),
    #[error(transparent)]
    Pcie(#[from] tl_pcie::PcieError),
    #[error(transparent)]
    Xml(#[from] regmap_xml::XmlError),
    /// A deferred value was observed while pending or after a failure.
    #[error("value not validated: {0}")]
    NonValidatedMemory(String),
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("cannot resolve endpoint {0:?}")]
    Resolve(String),
    #[error("no device named {0:?} in the connection file")]
    UnknownDevice(String),
    #[error("connection file {}: {reason}", path.display())]
    ConnectionFile { path: PathBuf, reason: String },
    #[error("device answered {received} of {expected} control packets")]
    MissingReplies { expected: usize, received: usize },
}
