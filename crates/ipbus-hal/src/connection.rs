//! The connection manager: connection-file loading, address-table caching,
//! device construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use quick_xml::events::Event;
use quick_xml::Reader;
use regmap_core::Node;
use tracing::{debug, info};

use crate::client::Client;
use crate::hw::HwInterface;
use crate::{HalError, Uri};

/// One entry of the connection file.
#[derive(Debug, Clone)]
struct Connection {
    uri: Uri,
    address_table: Uri,
}

/// Builds devices out of a connection file.
///
/// Address tables are cached by URI so that boards sharing a map parse it
/// once; the `Arc`ed trees are immutable and shared between devices. The
/// cache lock is held across the parse, serialising concurrent `get_device`
/// calls for the same table and leaving later calls lock-free hits.
pub struct ConnectionManager {
    connections: HashMap<String, Connection>,
    base_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Node>>>,
}

impl ConnectionManager {
    /// Load a connection file from a `file://` URI.
    pub fn from_uri(text: &str) -> Result<Self, HalError> {
        let uri = Uri::parse(text)?;
        if uri.protocol != "file" {
            return Err(HalError::UnsupportedProtocol(uri.protocol));
        }
        Self::from_file(Path::new(&file_path(&uri)))
    }

    /// Load a connection file from a filesystem path.
    pub fn from_file(path: &Path) -> Result<Self, HalError> {
        let text = std::fs::read_to_string(path).map_err(|source| HalError::ConnectionFile {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;
        let connections = parse_connections(&text, path)?;
        info!(path = %path.display(), devices = connections.len(), "connection file loaded");
        Ok(Self {
            connections,
            base_dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The device ids listed in the connection file.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Build the device registered under `id`.
    pub fn get_device(&self, id: &str) -> Result<HwInterface, HalError> {
        let connection = self
            .connections
            .get(id)
            .ok_or_else(|| HalError::UnknownDevice(id.to_string()))?;
        let tree = self.address_table(&connection.address_table)?;
        let client = Client::from_uri(id, connection.uri.clone())?;
        debug!(id, uri = %connection.uri, "device built");
        Ok(HwInterface::new(client, tree))
    }

    fn address_table(&self, table: &Uri) -> Result<Arc<Node>, HalError> {
        if table.protocol != "file" {
            return Err(HalError::UnsupportedProtocol(table.protocol.clone()));
        }
        let key = table.to_string();
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tree) = cache.get(&key) {
            return Ok(Arc::clone(tree));
        }
        let path = self.base_dir.join(file_path(table));
        let tree = Arc::new(regmap_xml::load_file(&path)?);
        cache.insert(key, Arc::clone(&tree));
        Ok(tree)
    }
}

/// Filesystem path of a `file://` URI. The host part, when present, is the
/// first path component (`file://cfg/x.xml` names `cfg/x.xml`).
fn file_path(uri: &Uri) -> String {
    let tail = uri.full_path();
    if uri.hostname.is_empty() {
        tail
    } else if tail.is_empty() {
        uri.hostname.clone()
    } else {
        format!("{}/{}", uri.hostname, tail)
    }
}

fn parse_connections(text: &str, path: &Path) -> Result<HashMap<String, Connection>, HalError> {
    let bad = |reason: String| HalError::ConnectionFile {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = Reader::from_reader(text.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut connections = HashMap::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|err| bad(err.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "connections" => {}
                    "connection" => {
                        let mut id = None;
                        let mut uri = None;
                        let mut table = None;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|err| bad(err.to_string()))?;
                            let value = attr
                                .unescape_value()
                                .map_err(|err| bad(err.to_string()))?
                                .to_string();
                            match attr.key.as_ref() {
                                b"id" => id = Some(value),
                                b"uri" => uri = Some(value),
                                b"address_table" => table = Some(value),
                                _ => {}
                            }
                        }
                        let id = id.ok_or_else(|| bad("connection without id".to_string()))?;
                        let uri = uri
                            .ok_or_else(|| bad(format!("connection {id:?} without uri")))?;
                        let table = table.ok_or_else(|| {
                            bad(format!("connection {id:?} without address_table"))
                        })?;
                        let connection = Connection {
                            uri: Uri::parse(&uri)?,
                            address_table: Uri::parse(&table)?,
                        };
                        if connections.insert(id.clone(), connection).is_some() {
                            return Err(bad(format!("duplicate connection id {id:?}")));
                        }
                    }
                    other => return Err(bad(format!("unexpected element {other:?}"))),
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(connections)
}
