//! The hardware interface: one client plus one shared address tree.
//!
//! The tree is an immutable template owned through an `Arc`, so several
//! interfaces built from the same address table share a single parse. Leaf
//! I/O goes through [`NodeView`] handles produced by lookup; the nodes
//! themselves never learn about the client.

use std::sync::Arc;
use std::time::Duration;

use regmap_core::{Mode, Node, RegMapError, NOMASK};
use tracing::trace;

use crate::client::Client;
use crate::val::{ValHeader, ValVector, ValWord};
use crate::{HalError, Uri};

/// A device: transport client and the claimed node tree.
pub struct HwInterface {
    client: Client,
    tree: Arc<Node>,
}

impl HwInterface {
    pub fn new(client: Client, tree: Arc<Node>) -> Self {
        Self { client, tree }
    }

    /// The connection's logical name.
    pub fn id(&self) -> &str {
        self.client.id()
    }

    /// The URI the client was built from.
    pub fn uri(&self) -> &Uri {
        self.client.uri()
    }

    /// Raw access to the transport client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The root of the address tree.
    pub fn root(&self) -> &Node {
        &self.tree
    }

    /// Look up a node by dotted path and bind it to this device.
    pub fn get_node(&self, path: &str) -> Result<NodeView<'_>, HalError> {
        let node = self.tree.get_node(path)?;
        trace!(id = self.client.id(), path, "node lookup");
        Ok(NodeView {
            client: &self.client,
            node,
            path: path.to_string(),
        })
    }

    /// Fully-qualified paths of every node in the tree.
    pub fn nodes(&self) -> Vec<String> {
        self.tree.nodes()
    }

    /// Paths matching a regular expression.
    pub fn nodes_matching(&self, pattern: &str) -> Result<Vec<String>, HalError> {
        self.tree.nodes_matching(pattern).map_err(Into::into)
    }

    /// Flush every queued transaction of this device.
    pub async fn dispatch(&self) -> Result<(), HalError> {
        self.client.dispatch().await
    }

    pub fn timeout(&self) -> Duration {
        self.client.timeout()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.client.set_timeout(timeout)
    }
}

/// A node bound to the device that owns it. Leaf I/O enqueues on the
/// client and returns deferred values; permission and bounds problems
/// surface here, at queueing time.
pub struct NodeView<'a> {
    client: &'a Client,
    node: &'a Node,
    path: String,
}

impl<'a> NodeView<'a> {
    /// The underlying tree node.
    pub fn node(&self) -> &'a Node {
        self.node
    }

    /// The dotted path this view was looked up with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a descendant relative to this node.
    pub fn get_node(&self, path: &str) -> Result<NodeView<'a>, HalError> {
        let node = self.node.get_node(path)?;
        Ok(NodeView {
            client: self.client,
            node,
            path: format!("{}.{path}", self.path),
        })
    }

    fn check_leaf(&self) -> Result<(), HalError> {
        if self.node.mode() == Mode::Hierarchical {
            return Err(RegMapError::BulkTransferOnSingleRegister {
                path: self.path.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Queue a read of this register. Masked nodes observe the aligned
    /// field value.
    pub fn read(&self) -> Result<ValWord, HalError> {
        self.check_leaf()?;
        self.node.check_readable(&self.path)?;
        Ok(self
            .client
            .read_masked(self.node.address(), self.node.mask()))
    }

    /// Queue a write of this register. A masked node is written through
    /// read-modify-write, preserving the bits outside its mask.
    pub fn write(&self, value: u32) -> Result<ValHeader, HalError> {
        self.check_leaf()?;
        self.node.check_writable(&self.path)?;
        if self.node.mask() == NOMASK {
            Ok(self.client.write(self.node.address(), value))
        } else {
            let rmw = self
                .client
                .write_masked(self.node.address(), value, self.node.mask());
            Ok(rmw.into_header())
        }
    }

    /// Queue a block read of `words` words.
    pub fn read_block(&self, words: u32) -> Result<ValVector, HalError> {
        self.node.check_readable(&self.path)?;
        self.node.check_block(&self.path, words, 0)?;
        Ok(match self.node.mode() {
            Mode::NonIncremental => self
                .client
                .read_block_non_inc(self.node.address(), words),
            _ => self.client.read_block(self.node.address(), words),
        })
    }

    /// Queue a block read of the node's full size.
    pub fn read_block_all(&self) -> Result<ValVector, HalError> {
        self.read_block(self.node.size())
    }

    /// Queue a block read starting `offset` words into the node. Only
    /// incremental blocks support offsets.
    pub fn read_block_offset(&self, words: u32, offset: u32) -> Result<ValVector, HalError> {
        self.node.check_readable(&self.path)?;
        self.node.check_block(&self.path, words, offset)?;
        Ok(self
            .client
            .read_block(self.node.address().wrapping_add(offset), words))
    }

    /// Queue a block write.
    pub fn write_block(&self, data: Vec<u32>) -> Result<ValHeader, HalError> {
        self.node.check_writable(&self.path)?;
        self.node.check_block(&self.path, data.len() as u32, 0)?;
        Ok(match self.node.mode() {
            Mode::NonIncremental => self
                .client
                .write_block_non_inc(self.node.address(), data),
            _ => self.client.write_block(self.node.address(), data),
        })
    }

    /// Queue a block write starting `offset` words into the node.
    pub fn write_block_offset(&self, data: Vec<u32>, offset: u32) -> Result<ValHeader, HalError> {
        self.node.check_writable(&self.path)?;
        self.node.check_block(&self.path, data.len() as u32, offset)?;
        Ok(self
            .client
            .write_block(self.node.address().wrapping_add(offset), data))
    }
}
