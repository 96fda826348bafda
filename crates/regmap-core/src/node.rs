//! The immutable node tree and its lookup operations.

use regex::Regex;

use crate::{Mode, Permission, RegMapError, NOMASK};

/// A named point in the device address map.
///
/// Interior nodes group children; leaves map registers, blocks or ports.
/// Addresses are absolute, baked in at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) id: String,
    pub(crate) address: u32,
    pub(crate) size: u32,
    pub(crate) mode: Mode,
    pub(crate) mask: u32,
    pub(crate) permission: Permission,
    pub(crate) tags: String,
    pub(crate) description: String,
    pub(crate) module: String,
    pub(crate) fwinfo: String,
    pub(crate) children: Vec<Node>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn tags(&self) -> &str {
        &self.tags
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn fwinfo(&self) -> &str {
        &self.fwinfo
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Look up a descendant by dotted path. Case-sensitive.
    pub fn get_node(&self, path: &str) -> Result<&Node, RegMapError> {
        let mut current = self;
        let mut walked = String::new();
        for segment in path.split('.') {
            match current.children.iter().find(|child| child.id == segment) {
                Some(child) => {
                    if !walked.is_empty() {
                        walked.push('.');
                    }
                    walked.push_str(segment);
                    current = child;
                }
                None => {
                    return Err(RegMapError::NoBranchFound {
                        path: walked,
                        missing: segment.to_string(),
                    });
                }
            }
        }
        Ok(current)
    }

    /// Fully-qualified paths of every descendant, pre-order, children in
    /// construction order.
    pub fn nodes(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(self, None, &mut out);
        out
    }

    /// The subset of [`Node::nodes`] whose path matches the expression.
    pub fn nodes_matching(&self, pattern: &str) -> Result<Vec<String>, RegMapError> {
        let re = Regex::new(pattern)?;
        Ok(self
            .nodes()
            .into_iter()
            .filter(|path| re.is_match(path))
            .collect())
    }

    /// Check that a single-word read is legal here.
    pub fn check_readable(&self, path: &str) -> Result<(), RegMapError> {
        if !self.permission.readable() {
            return Err(RegMapError::ReadAccessDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Check that a single-word write is legal here. Masked nodes are
    /// written through read-modify-write, so they also need read access.
    pub fn check_writable(&self, path: &str) -> Result<(), RegMapError> {
        if !self.permission.writable() {
            return Err(RegMapError::WriteAccessDenied {
                path: path.to_string(),
            });
        }
        if self.mask != NOMASK && !self.permission.readable() {
            return Err(RegMapError::ReadAccessDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Check that a block transfer of `words` words starting `offset` words
    /// into the node is legal here.
    pub fn check_block(&self, path: &str, words: u32, offset: u32) -> Result<(), RegMapError> {
        if !self.mode.is_block() {
            return Err(RegMapError::BulkTransferOnSingleRegister {
                path: path.to_string(),
            });
        }
        if offset > 0 && self.mode != Mode::Incremental {
            return Err(RegMapError::BulkTransferOffsetOnPort {
                path: path.to_string(),
            });
        }
        if offset > self.size || words > self.size - offset {
            return Err(RegMapError::BulkTransferTooLarge {
                path: path.to_string(),
                requested: words,
                size: self.size,
                offset,
            });
        }
        Ok(())
    }
}

fn collect_paths(node: &Node, prefix: Option<&str>, out: &mut Vec<String>) {
    for child in &node.children {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{}", child.id),
            None => child.id.clone(),
        };
        out.push(path.clone());
        collect_paths(child, Some(&path), out);
    }
}
