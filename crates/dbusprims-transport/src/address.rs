//! D-Bus server address syntax.
//!
//! An address string is a `;`-separated list of entries, each of the form
//! `transport:key=value,key=value`. Values may percent-escape any byte as
//! `%XX`. Only the `unix` and `tcp` transports are understood here.

use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransportError};

/// A single resolved bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// Filesystem Unix domain socket (`unix:path=...`).
    Unix { path: PathBuf },
    /// Linux abstract-namespace socket (`unix:abstract=...`).
    UnixAbstract { name: String },
    /// TCP socket (`tcp:host=...,port=...`).
    Tcp { host: String, port: u16 },
}

impl BusAddress {
    /// Parse a single address entry.
    ///
    /// When `input` contains several `;`-separated entries, the first one
    /// this crate supports is returned.
    pub fn parse(input: &str) -> Result<Self> {
        let mut last_err = None;
        for entry in input.split(';').filter(|entry| !entry.is_empty()) {
            match parse_entry(entry) {
                Ok(address) => return Ok(address),
                Err(err @ TransportError::UnsupportedTransport(_)) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| invalid(input, "empty address")))
    }

    /// Parse every entry of an address list, failing on the first bad entry.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input
            .split(';')
            .filter(|entry| !entry.is_empty())
            .map(parse_entry)
            .collect()
    }

    /// Transport name as it appears before the colon.
    pub fn transport_name(&self) -> &'static str {
        match self {
            BusAddress::Unix { .. } | BusAddress::UnixAbstract { .. } => "unix",
            BusAddress::Tcp { .. } => "tcp",
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Unix { path } => {
                write!(f, "unix:path={}", escape(&path.to_string_lossy()))
            }
            BusAddress::UnixAbstract { name } => write!(f, "unix:abstract={}", escape(name)),
            BusAddress::Tcp { host, port } => write!(f, "tcp:host={},port={port}", escape(host)),
        }
    }
}

impl std::str::FromStr for BusAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_entry(entry: &str) -> Result<BusAddress> {
    let (transport, rest) = entry
        .split_once(':')
        .ok_or_else(|| invalid(entry, "missing ':' after transport name"))?;
    if transport.is_empty() {
        return Err(invalid(entry, "empty transport name"));
    }

    let mut pairs = Vec::new();
    for pair in rest.split(',').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid(entry, &format!("'{pair}' is not key=value")))?;
        if key.is_empty() {
            return Err(invalid(entry, "empty key"));
        }
        pairs.push((key, unescape(entry, value)?));
    }

    let lookup = |name: &str| {
        pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
    };

    match transport {
        "unix" => {
            if let Some(path) = lookup("path") {
                Ok(BusAddress::Unix {
                    path: PathBuf::from(path),
                })
            } else if let Some(name) = lookup("abstract") {
                Ok(BusAddress::UnixAbstract { name })
            } else {
                Err(invalid(entry, "unix address needs path= or abstract="))
            }
        }
        "tcp" => {
            let host = lookup("host").unwrap_or_else(|| "localhost".to_string());
            let port = lookup("port").ok_or_else(|| invalid(entry, "tcp address needs port="))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(entry, &format!("invalid port '{port}'")))?;
            Ok(BusAddress::Tcp { host, port })
        }
        other => Err(TransportError::UnsupportedTransport(other.to_string())),
    }
}

fn unescape(entry: &str, value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| invalid(entry, "bad percent escape"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid(entry, "escaped value is not UTF-8"))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_/.\\*".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}

fn invalid(address: &str, reason: &str) -> TransportError {
    TransportError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let addr = BusAddress::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(
            addr,
            BusAddress::Unix {
                path: PathBuf::from("/run/user/1000/bus")
            }
        );
        assert_eq!(addr.transport_name(), "unix");
    }

    #[test]
    fn parses_tcp_with_default_host() {
        let addr = BusAddress::parse("tcp:port=4000").unwrap();
        assert_eq!(
            addr,
            BusAddress::Tcp {
                host: "localhost".to_string(),
                port: 4000
            }
        );
    }

    #[test]
    fn unescapes_values() {
        let addr = BusAddress::parse("unix:path=/tmp/with%20space").unwrap();
        assert_eq!(
            addr,
            BusAddress::Unix {
                path: PathBuf::from("/tmp/with space")
            }
        );
        assert_eq!(addr.to_string(), "unix:path=/tmp/with%20space");
    }

    #[test]
    fn first_supported_entry_wins() {
        let addr = BusAddress::parse("launchd:env=FOO;tcp:host=127.0.0.1,port=9").unwrap();
        assert_eq!(addr.transport_name(), "tcp");
    }

    #[test]
    fn list_rejects_unsupported_entry() {
        let err = BusAddress::parse_list("unix:path=/a;nonce-tcp:port=1").unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedTransport(name) if name == "nonce-tcp"));
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            BusAddress::parse("unix"),
            Err(TransportError::InvalidAddress { .. })
        ));
        assert!(matches!(
            BusAddress::parse("unix:path"),
            Err(TransportError::InvalidAddress { .. })
        ));
        assert!(matches!(
            BusAddress::parse("tcp:host=x,port=99999"),
            Err(TransportError::InvalidAddress { .. })
        ));
        assert!(matches!(
            BusAddress::parse("unix:path=%zz"),
            Err(TransportError::InvalidAddress { .. })
        ));
        assert!(matches!(
            BusAddress::parse(""),
            Err(TransportError::InvalidAddress { .. })
        ));
    }
}
