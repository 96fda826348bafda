//! Connection URI model and parser.
//!
//! `proto://[host][:port][/path[.ext]][?k1=v1&k2=v2]`. All fields are
//! strings and absent fields are empty. Whitespace between tokens is
//! tolerated for compatibility with hand-edited connection files, but each
//! parse that strips any is reported through a warning.

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("cannot parse {offending:?} in URI {uri:?}: {reason}")]
pub struct UriParseError {
    pub uri: String,
    pub offending: String,
    pub reason: &'static str,
}

/// Structured form of a connection URI. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Uri {
    pub protocol: String,
    pub hostname: String,
    pub port: String,
    pub path: String,
    pub extension: String,
    /// Key/value arguments in source order. Keys are unique.
    pub arguments: Vec<(String, String)>,
}

impl Uri {
    /// Parse a URI string.
    pub fn parse(text: &str) -> Result<Self, UriParseError> {
        let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if stripped.len() != text.len() {
            warn!(uri = text, "whitespace inside URI tolerated but deprecated");
        }
        let fail = |offending: &str, reason: &'static str| UriParseError {
            uri: text.to_string(),
            offending: offending.to_string(),
            reason,
        };

        let (protocol, rest) = stripped
            .split_once("://")
            .ok_or_else(|| fail(&stripped, "missing '://' separator"))?;
        if protocol.is_empty() || !protocol.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        {
            return Err(fail(protocol, "protocol must start with a letter"));
        }
        if !protocol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(fail(protocol, "protocol contains an invalid character"));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut uri = Uri {
            protocol: protocol.to_string(),
            ..Uri::default()
        };

        // A location starting with '/' has no authority; the remainder is a
        // bare absolute path (device-file transports), kept verbatim.
        if location.starts_with('/') {
            split_path(location, &mut uri);
        } else {
            let (authority, path) = match location.split_once('/') {
                Some((authority, path)) => (authority, Some(path)),
                None => (location, None),
            };
            match authority.split_once(':') {
                Some((host, port)) => {
                    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                        return Err(fail(port, "port must be decimal digits"));
                    }
                    uri.hostname = host.to_string();
                    uri.port = port.to_string();
                }
                None => uri.hostname = authority.to_string(),
            }
            if let Some(path) = path {
                split_path(path, &mut uri);
            }
        }

        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| fail(pair, "argument is not key=value"))?;
                if key.is_empty() {
                    return Err(fail(pair, "argument key is empty"));
                }
                if uri.arguments.iter().any(|(existing, _)| existing == key) {
                    return Err(fail(key, "duplicate argument key"));
                }
                uri.arguments.push((key.to_string(), value.to_string()));
            }
        }

        Ok(uri)
    }

    /// Argument value by key.
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// The path with its extension re-attached.
    pub fn full_path(&self) -> String {
        if self.extension.is_empty() {
            self.path.clone()
        } else {
            format!("{}.{}", self.path, self.extension)
        }
    }
}

/// Split a trailing extension off the last path segment.
fn split_path(path: &str, uri: &mut Uri) {
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    match last_segment.rfind('.') {
        Some(dot) if dot > 0 => {
            let split_at = path.len() - (last_segment.len() - dot);
            uri.path = path[..split_at].to_string();
            uri.extension = path[split_at + 1..].to_string();
        }
        _ => uri.path = path.to_string(),
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.hostname)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        if !self.path.is_empty() {
            if !self.path.starts_with('/') {
                write!(f, "/")?;
            }
            write!(f, "{}", self.path)?;
        }
        if !self.extension.is_empty() {
            write!(f, ".{}", self.extension)?;
        }
        for (index, (key, value)) in self.arguments.iter().enumerate() {
            write!(f, "{}{key}={value}", if index == 0 { "?" } else { "&" })?;
        }
        Ok(())
    }
}
