//! Address-table XML loading. Use quick-xml.
//!
//! Tables are recursive `<node>` elements. The `address` attribute is an
//! offset against the parent node; absolute addresses are baked in by the
//! tree builder. A `module` attribute includes another table file at that
//! subtree: the referenced root's children are merged as children of the
//! including node, shifted by the including node's address.

use std::path::{Path, PathBuf};

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regmap_core::{Mode, Node, NodeBuilder, Permission, RegMapError};
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum depth of `module` inclusion before assuming a cycle.
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml: {0}")]
    Xml(String),
    #[error("io while reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad attribute {attr}={value:?}")]
    BadAttribute { attr: &'static str, value: String },
    #[error("node element without an id")]
    MissingId,
    #[error("unexpected element {0:?} in address table")]
    UnexpectedElement(String),
    #[error("module inclusion nested deeper than {MAX_INCLUDE_DEPTH} (cycle?) at {}", .0.display())]
    IncludeTooDeep(PathBuf),
    #[error("module attribute {0:?} is not a file:// reference")]
    BadModuleRef(String),
    #[error(transparent)]
    RegMap(#[from] RegMapError),
}

impl From<quick_xml::Error> for XmlError {
    fn from(err: quick_xml::Error) -> Self {
        XmlError::Xml(err.to_string())
    }
}

/// Raw parse of one `<node>` element tree, includes unresolved.
#[derive(Debug, Clone, Default)]
struct RawNode {
    id: String,
    address: u32,
    mask: Option<u32>,
    permission: Option<Permission>,
    mode: Option<Mode>,
    size: Option<u32>,
    tags: String,
    description: String,
    module: String,
    fwinfo: String,
    children: Vec<RawNode>,
}

/// Load an address table from a file, resolving `module` inclusions
/// relative to the file's directory.
pub fn load_file(path: &Path) -> Result<Node, XmlError> {
    let builder = load_builder(path, 0)?;
    let node = builder.build()?;
    debug!(path = %path.display(), nodes = node.nodes().len(), "address table loaded");
    Ok(node)
}

/// Parse an address table from a string. `module` inclusions are rejected
/// because there is no base directory to resolve them against.
pub fn parse_str(xml: &str) -> Result<Node, XmlError> {
    let raw = parse_document(xml)?;
    Ok(into_builder(raw, None, 0)?.build()?)
}

fn load_builder(path: &Path, depth: usize) -> Result<NodeBuilder, XmlError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(XmlError::IncludeTooDeep(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| XmlError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = parse_document(&text)?;
    into_builder(raw, path.parent(), depth)
}

fn parse_document(xml: &str) -> Result<RawNode, XmlError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<RawNode> = Vec::new();
    let mut root: Option<RawNode> = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let node = start_node(&e, stack.is_empty())?;
                stack.push(node);
            }
            Event::Empty(e) => {
                let node = start_node(&e, stack.is_empty())?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| XmlError::Xml("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, node);
            }
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            other => {
                trace!(?other, "ignoring xml event");
            }
        }
        buf.clear();
    }
    root.ok_or_else(|| XmlError::Xml("no root <node> element".into()))
}

fn attach(stack: &mut Vec<RawNode>, root: &mut Option<RawNode>, node: RawNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

fn start_node(e: &BytesStart<'_>, is_root: bool) -> Result<RawNode, XmlError> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
    if tag != "node" {
        return Err(XmlError::UnexpectedElement(tag));
    }
    let mut node = RawNode::default();
    let mut has_id = false;
    for attr in e.attributes() {
        let attr: Attribute<'_> = attr.map_err(|err| XmlError::Xml(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| XmlError::Xml(err.to_string()))?
            .to_string();
        match attr.key.as_ref() {
            b"id" => {
                node.id = value;
                has_id = true;
            }
            b"address" => node.address = parse_u32("address", &value)?,
            b"mask" => node.mask = Some(parse_u32("mask", &value)?),
            b"permission" => node.permission = Some(parse_permission(&value)?),
            b"mode" => node.mode = Some(parse_mode(&value)?),
            b"size" => node.size = Some(parse_u32("size", &value)?),
            b"tags" => node.tags = value,
            b"description" => node.description = value,
            b"module" => node.module = value,
            b"fwinfo" => node.fwinfo = value,
            // Unknown attributes are ignored.
            _ => {}
        }
    }
    if !has_id && !is_root {
        return Err(XmlError::MissingId);
    }
    Ok(node)
}

fn parse_u32(attr: &'static str, value: &str) -> Result<u32, XmlError> {
    let text = value.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| XmlError::BadAttribute {
        attr,
        value: value.to_string(),
    })
}

fn parse_permission(value: &str) -> Result<Permission, XmlError> {
    match value {
        "r" => Ok(Permission::Read),
        "w" => Ok(Permission::Write),
        "rw" | "wr" => Ok(Permission::ReadWrite),
        _ => Err(XmlError::BadAttribute {
            attr: "permission",
            value: value.to_string(),
        }),
    }
}

fn parse_mode(value: &str) -> Result<Mode, XmlError> {
    match value {
        "single" => Ok(Mode::Single),
        "incremental" => Ok(Mode::Incremental),
        "non-incremental" => Ok(Mode::NonIncremental),
        "hierarchical" => Ok(Mode::Hierarchical),
        _ => Err(XmlError::BadAttribute {
            attr: "mode",
            value: value.to_string(),
        }),
    }
}

/// Mode when the table does not spell one out: an explicit size makes a
/// block, children make a grouping, anything else is a plain register.
fn effective_mode(raw: &RawNode) -> Mode {
    match raw.mode {
        Some(mode) => mode,
        None if raw.size.is_some() => Mode::Incremental,
        None if !raw.children.is_empty() || !raw.module.is_empty() => Mode::Hierarchical,
        None => Mode::Single,
    }
}

fn into_builder(
    raw: RawNode,
    base_dir: Option<&Path>,
    depth: usize,
) -> Result<NodeBuilder, XmlError> {
    let mode = effective_mode(&raw);
    let mut builder = match mode {
        Mode::Hierarchical if raw.id.is_empty() => NodeBuilder::root(),
        Mode::Hierarchical => NodeBuilder::group(&raw.id),
        Mode::Single => NodeBuilder::register(&raw.id),
        Mode::Incremental | Mode::NonIncremental => {
            NodeBuilder::block(&raw.id, raw.size.unwrap_or(1)).mode(mode)
        }
    };
    builder = builder
        .address(raw.address)
        .tags(&raw.tags)
        .description(&raw.description)
        .module(&raw.module)
        .fwinfo(&raw.fwinfo);
    if let Some(mask) = raw.mask {
        builder = builder.mask(mask);
    }
    if let Some(permission) = raw.permission {
        builder = builder.permission(permission);
    }
    if let Some(size) = raw.size {
        builder = builder.size(size);
    }

    if !raw.module.is_empty() {
        let included = resolve_module(&raw.module, base_dir, depth)?;
        builder = builder.children(inherit_tags(included, &raw.tags));
    }

    for child in raw.children {
        builder = builder.child(into_builder(child, base_dir, depth)?);
    }
    Ok(builder)
}

fn resolve_module(
    reference: &str,
    base_dir: Option<&Path>,
    depth: usize,
) -> Result<Vec<NodeBuilder>, XmlError> {
    let relative = reference
        .strip_prefix("file://")
        .ok_or_else(|| XmlError::BadModuleRef(reference.to_string()))?;
    let path = match base_dir {
        Some(dir) => dir.join(relative),
        None => return Err(XmlError::BadModuleRef(reference.to_string())),
    };
    trace!(path = %path.display(), depth, "including module table");
    let included = load_builder(&path, depth + 1)?;
    Ok(included.into_children())
}

/// Children merged from an included table inherit the including node's tags
/// when they carry none of their own.
fn inherit_tags(children: Vec<NodeBuilder>, tags: &str) -> Vec<NodeBuilder> {
    if tags.is_empty() {
        return children;
    }
    children
        .into_iter()
        .map(|child| {
            if child.tags_ref().is_empty() {
                child.tags(tags)
            } else {
                child
            }
        })
        .collect()
}
