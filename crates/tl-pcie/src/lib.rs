//! PCIe control transport over a pair of character device files.
//!
//! The host writes control packets to the host-to-device file and reads
//! replies from the device-to-board counterpart. The link is lossless and
//! ordered, so there is no reliability machinery: each packet is written,
//! then its reply is read back, bounded by the transport timeout. Frames on
//! the stream are length-prefixed with their word count.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::{debug, info, trace};

/// Default bound on a single packet round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Words available for transactions in one frame.
pub const FRAME_CAPACITY_WORDS: usize = 4096;

/// Largest frame accepted from the device, in words.
const MAX_FRAME_WORDS: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum PcieError {
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("timeout waiting for a reply on {}", .0.display())]
    Timeout(PathBuf),
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
    #[error("device path {0:?} must name the host-to-device and device-to-host files separated by a comma")]
    BadPath(String),
}

/// Control transport over an XDMA-style device file pair.
pub struct PcieTransport {
    h2d_path: PathBuf,
    d2h_path: PathBuf,
    files: Option<(File, File)>,
    timeout: Duration,
}

impl PcieTransport {
    /// Build a transport from a URI path of the form
    /// `/dev/xdma0_h2c_0,/dev/xdma0_c2h_0`.
    pub fn from_uri_path(path: &str) -> Result<Self, PcieError> {
        let (h2d, d2h) = path
            .split_once(',')
            .ok_or_else(|| PcieError::BadPath(path.to_string()))?;
        if h2d.is_empty() || d2h.is_empty() {
            return Err(PcieError::BadPath(path.to_string()));
        }
        Ok(Self::new(Path::new(h2d), Path::new(d2h)))
    }

    pub fn new(h2d: &Path, d2h: &Path) -> Self {
        Self {
            h2d_path: h2d.to_path_buf(),
            d2h_path: d2h.to_path_buf(),
            files: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Words available for transactions in one control frame.
    pub fn packet_capacity_words(&self) -> usize {
        FRAME_CAPACITY_WORDS
    }

    /// Open both device files if not already open.
    pub async fn ensure_ready(&mut self) -> Result<(), PcieError> {
        if self.files.is_some() {
            return Ok(());
        }
        let h2d = OpenOptions::new()
            .write(true)
            .open(&self.h2d_path)
            .await
            .map_err(|source| PcieError::Io {
                path: self.h2d_path.clone(),
                source,
            })?;
        let d2h = File::open(&self.d2h_path)
            .await
            .map_err(|source| PcieError::Io {
                path: self.d2h_path.clone(),
                source,
            })?;
        info!(h2d = %self.h2d_path.display(), d2h = %self.d2h_path.display(), "device files opened");
        self.files = Some((h2d, d2h));
        Ok(())
    }

    /// Write each packet and read back its reply, in order.
    pub async fn exchange(&mut self, packets: Vec<BytesMut>) -> Result<Vec<Bytes>, PcieError> {
        if packets.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;
        let timeout = self.timeout;
        let (h2d_path, d2h_path) = (self.h2d_path.clone(), self.d2h_path.clone());
        let (h2d, d2h) = self
            .files
            .as_mut()
            .unwrap_or_else(|| unreachable!("files opened in ensure_ready"));
        let mut replies = Vec::with_capacity(packets.len());
        for packet in packets {
            trace!(bytes = packet.len(), "writing control frame");
            write_frame(h2d, &packet)
                .await
                .map_err(|source| PcieError::Io {
                    path: h2d_path.clone(),
                    source,
                })?;
            let reply = match time::timeout(timeout, read_frame(d2h)).await {
                Err(_) => return Err(PcieError::Timeout(d2h_path.clone())),
                Ok(Err(FrameReadError::Io(source))) => {
                    return Err(PcieError::Io {
                        path: d2h_path.clone(),
                        source,
                    });
                }
                Ok(Err(FrameReadError::Malformed(reason))) => {
                    return Err(PcieError::BadFrame(reason));
                }
                Ok(Ok(reply)) => reply,
            };
            debug!(bytes = reply.len(), "control frame answered");
            replies.push(reply);
        }
        Ok(replies)
    }
}

#[derive(Debug)]
enum FrameReadError {
    Io(std::io::Error),
    Malformed(&'static str),
}

impl From<std::io::Error> for FrameReadError {
    fn from(err: std::io::Error) -> Self {
        FrameReadError::Io(err)
    }
}

/// Write one length-prefixed frame.
async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> std::io::Result<()> {
    debug_assert_eq!(frame.len() % 4, 0);
    let words = (frame.len() / 4) as u32;
    writer.write_all(&words.to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
async fn read_frame(reader: &mut (impl AsyncRead + Unpin)) -> Result<Bytes, FrameReadError> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length).await?;
    let words = u32::from_le_bytes(length);
    if words == 0 || words > MAX_FRAME_WORDS {
        return Err(FrameReadError::Malformed("frame length out of range"));
    }
    let mut frame = vec![0u8; words as usize * 4];
    reader.read_exact(&mut frame).await?;
    Ok(Bytes::from(frame))
}
