//! Tree assembly with construction-time invariant checks.

use std::collections::HashSet;

use tracing::debug;

use crate::{Mode, Node, Permission, RegMapError, NOMASK};

/// Builder for one node and its subtree.
///
/// Addresses given to the builder are offsets against the parent node; the
/// absolute address is baked in at [`NodeBuilder::build`] time and never
/// re-derived afterwards.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    id: String,
    offset: u32,
    size: u32,
    mode: Mode,
    mask: u32,
    permission: Permission,
    tags: String,
    description: String,
    module: String,
    fwinfo: String,
    children: Vec<NodeBuilder>,
}

impl NodeBuilder {
    fn new(id: &str, mode: Mode, size: u32) -> Self {
        Self {
            id: id.to_string(),
            offset: 0,
            size,
            mode,
            mask: NOMASK,
            permission: Permission::ReadWrite,
            tags: String::new(),
            description: String::new(),
            module: String::new(),
            fwinfo: String::new(),
            children: Vec::new(),
        }
    }

    /// The unnamed root of an address table.
    pub fn root() -> Self {
        Self::new("", Mode::Hierarchical, 1)
    }

    /// An interior grouping node.
    pub fn group(id: &str) -> Self {
        Self::new(id, Mode::Hierarchical, 1)
    }

    /// A plain single-word register.
    pub fn register(id: &str) -> Self {
        Self::new(id, Mode::Single, 1)
    }

    /// A block of `size` words, incremental unless overridden.
    pub fn block(id: &str, size: u32) -> Self {
        Self::new(id, Mode::Incremental, size)
    }

    /// Address offset against the parent node.
    pub fn address(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    pub fn fwinfo(mut self, fwinfo: &str) -> Self {
        self.fwinfo = fwinfo.to_string();
        self
    }

    pub fn child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = NodeBuilder>) -> Self {
        self.children.extend(children);
        self
    }

    /// Tags set so far (table loaders use this for inheritance rules).
    pub fn tags_ref(&self) -> &str {
        &self.tags
    }

    /// Give up this builder and hand out its children (table loaders merge
    /// an included root's children into the including node).
    pub fn into_children(self) -> Vec<NodeBuilder> {
        self.children
    }

    /// Bake absolute addresses and validate the whole subtree.
    pub fn build(self) -> Result<Node, RegMapError> {
        let node = self.build_at(0)?;
        debug!(nodes = node.nodes().len(), "address tree built");
        Ok(node)
    }

    fn build_at(self, base: u32) -> Result<Node, RegMapError> {
        self.validate()?;
        let address = base.wrapping_add(self.offset);
        let mut seen = HashSet::new();
        for child in &self.children {
            if !seen.insert(child.id.as_str()) {
                return Err(RegMapError::DuplicateId {
                    parent: self.id.clone(),
                    id: child.id.clone(),
                });
            }
        }
        let children = self
            .children
            .into_iter()
            .map(|child| child.build_at(address))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Node {
            id: self.id,
            address,
            size: self.size,
            mode: self.mode,
            mask: self.mask,
            permission: self.permission,
            tags: self.tags,
            description: self.description,
            module: self.module,
            fwinfo: self.fwinfo,
            children,
        })
    }

    fn validate(&self) -> Result<(), RegMapError> {
        let invalid = |reason: &str| {
            Err(RegMapError::InvalidNode {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.id.contains('.') {
            return invalid("node id contains '.'");
        }
        if self.mask == 0 {
            return invalid("mask has no bits set");
        }
        match self.mode {
            Mode::Single => {
                if self.size != 1 {
                    return invalid("single register with size != 1");
                }
            }
            Mode::Incremental | Mode::NonIncremental => {
                if self.size < 1 {
                    return invalid("block with size 0");
                }
                if self.mask != NOMASK {
                    return invalid("block with a sub-word mask");
                }
            }
            Mode::Hierarchical => {
                if self.mask != NOMASK {
                    return invalid("hierarchical node with a mask");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_addresses_accumulate_offsets() {
        let root = NodeBuilder::root()
            .child(
                NodeBuilder::group("SUB").address(0x200000).child(
                    NodeBuilder::group("INNER")
                        .address(0x10)
                        .child(NodeBuilder::register("REG").address(0x1)),
                ),
            )
            .build()
            .expect("valid tree");
        assert_eq!(root.get_node("SUB.INNER.REG").expect("lookup").address(), 0x200011);
    }

    #[test]
    fn duplicate_sibling_ids_rejected() {
        let err = NodeBuilder::root()
            .child(NodeBuilder::register("REG"))
            .child(NodeBuilder::register("REG").address(0x1))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegMapError::DuplicateId { .. }));
    }

    #[test]
    fn same_id_on_different_levels_is_fine() {
        let root = NodeBuilder::root()
            .child(NodeBuilder::register("REG").address(0x1))
            .child(
                NodeBuilder::group("SUB")
                    .address(0x100)
                    .child(NodeBuilder::register("REG").address(0x1)),
            )
            .build()
            .expect("valid tree");
        assert_eq!(root.get_node("REG").expect("lookup").address(), 0x1);
        assert_eq!(root.get_node("SUB.REG").expect("lookup").address(), 0x101);
    }

    #[test]
    fn single_register_with_block_size_rejected() {
        let err = NodeBuilder::root()
            .child(NodeBuilder::register("REG").size(4))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegMapError::InvalidNode { .. }));
    }

    #[test]
    fn masked_block_rejected() {
        let err = NodeBuilder::root()
            .child(NodeBuilder::block("MEM", 16).mask(0xFF))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegMapError::InvalidNode { .. }));
    }

    #[test]
    fn zero_mask_rejected() {
        let err = NodeBuilder::root()
            .child(NodeBuilder::register("REG").mask(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegMapError::InvalidNode { .. }));
    }
}
