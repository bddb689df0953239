use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use dbusprims_transport::TransportError;
use tracing::debug;

use crate::auth::{generate_guid, AuthMachine, Mechanism, DEFAULT_MAX_LINE_LENGTH};
use crate::error::{PeerError, Result};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Configuration for the text handshake.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Client: mechanisms to try, in order. Server: mechanisms accepted.
    pub mechanisms: Vec<Mechanism>,
    /// Server GUID to announce in `OK`. A random one is generated when unset.
    pub server_guid: Option<String>,
    /// Longest accepted protocol line in bytes.
    pub max_line_length: usize,
    /// Client initial response for `ANONYMOUS`.
    /// Sent in clear text on the socket and never logged.
    pub anonymous_trace: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            mechanisms: vec![Mechanism::External, Mechanism::Anonymous],
            server_guid: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            anonymous_trace: None,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("HandshakeConfig");
        dbg.field("timeout", &self.timeout)
            .field("mechanisms", &self.mechanisms)
            .field("server_guid", &self.server_guid)
            .field("max_line_length", &self.max_line_length);
        if let Some(trace) = &self.anonymous_trace {
            dbg.field(
                "anonymous_trace",
                &format_args!("<redacted:{} bytes>", trace.len()),
            );
        } else {
            dbg.field("anonymous_trace", &Option::<String>::None);
        }
        dbg.finish()
    }
}

/// Result of a successful handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// GUID of the server side of the connection.
    pub guid: String,
    /// Mechanism that was accepted.
    pub mechanism: Mechanism,
    /// Binary bytes that arrived in the same read as the final text line.
    pub leftover: Vec<u8>,
    /// Decoded initial response seen by the server side.
    pub client_identity: Option<String>,
}

impl HandshakeResult {
    /// Result for a connection that skipped the text handshake.
    pub fn unauthenticated(guid: Option<String>) -> Self {
        Self {
            guid: guid.unwrap_or_else(generate_guid),
            mechanism: Mechanism::Anonymous,
            leftover: Vec::new(),
            client_identity: None,
        }
    }
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("HandshakeResult");
        dbg.field("guid", &self.guid)
            .field("mechanism", &self.mechanism)
            .field("leftover", &format_args!("{} bytes", self.leftover.len()));
        if let Some(identity) = &self.client_identity {
            dbg.field(
                "client_identity",
                &format_args!("<redacted:{} bytes>", identity.len()),
            );
        } else {
            dbg.field("client_identity", &Option::<String>::None);
        }
        dbg.finish()
    }
}

/// Perform the client side of the handshake using default configuration.
pub fn handshake_client<S: Read + Write>(stream: &mut S) -> Result<HandshakeResult> {
    handshake_client_with_config(stream, &HandshakeConfig::default())
}

/// Perform the client side of the handshake using explicit configuration.
///
/// The stream should carry a read timeout so the deadline can be observed.
pub fn handshake_client_with_config<S: Read + Write>(
    stream: &mut S,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_config(config)?;

    let mut machine = AuthMachine::client(&config.mechanisms, local_uid())
        .with_max_line_length(config.max_line_length);
    if let Some(trace) = &config.anonymous_trace {
        machine = machine.with_anonymous_trace(trace.clone());
    }

    let first = machine.start()?;
    write_all(stream, &first)?;
    drive(stream, &mut machine, config.timeout)?;

    let guid = machine
        .guid()
        .map(str::to_string)
        .ok_or_else(|| PeerError::HandshakeFailed("server sent no GUID".to_string()))?;
    let mechanism = accepted_mechanism(&machine)?;
    debug!(%mechanism, "client handshake complete");

    Ok(HandshakeResult {
        guid,
        mechanism,
        leftover: machine.take_leftover(),
        client_identity: None,
    })
}

/// Perform the server side of the handshake using default configuration.
///
/// `peer_uid` is what the transport reports for the socket; `EXTERNAL`
/// claims are checked against it.
pub fn handshake_server<S: Read + Write>(
    stream: &mut S,
    peer_uid: Option<u32>,
) -> Result<HandshakeResult> {
    handshake_server_with_config(stream, peer_uid, &HandshakeConfig::default())
}

/// Perform the server side of the handshake using explicit configuration.
pub fn handshake_server_with_config<S: Read + Write>(
    stream: &mut S,
    peer_uid: Option<u32>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_config(config)?;

    let guid = match &config.server_guid {
        Some(guid) => guid.clone(),
        None => generate_guid(),
    };
    let mut machine = AuthMachine::server(guid.clone(), &config.mechanisms, peer_uid)
        .with_max_line_length(config.max_line_length);
    drive(stream, &mut machine, config.timeout)?;

    let mechanism = accepted_mechanism(&machine)?;
    debug!(%mechanism, "server handshake complete");

    Ok(HandshakeResult {
        guid,
        mechanism,
        client_identity: machine.client_identity().map(str::to_string),
        leftover: machine.take_leftover(),
    })
}

fn drive<S: Read + Write>(stream: &mut S, machine: &mut AuthMachine, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while !machine.is_complete() {
        if Instant::now() >= deadline {
            return Err(PeerError::Timeout(timeout));
        }

        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(PeerError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(TransportError::Io(err).into()),
        };

        let reply = machine.feed(&chunk[..read])?;
        if !reply.is_empty() {
            write_all(stream, &reply)?;
        }
    }
    Ok(())
}

fn write_all<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    match stream.write_all(bytes).and_then(|()| stream.flush()) {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => Err(
            PeerError::Disconnected("connection closed during handshake".to_string()),
        ),
        Err(err) => Err(TransportError::Io(err).into()),
    }
}

fn accepted_mechanism(machine: &AuthMachine) -> Result<Mechanism> {
    machine
        .mechanism()
        .ok_or_else(|| PeerError::HandshakeFailed("no mechanism selected".to_string()))
}

fn validate_config(config: &HandshakeConfig) -> Result<()> {
    if config.mechanisms.is_empty() {
        return Err(PeerError::HandshakeFailed(
            "no authentication mechanisms configured".to_string(),
        ));
    }
    if let Some(guid) = &config.server_guid {
        if guid.len() != 32 || hex::decode(guid).is_err() {
            return Err(PeerError::HandshakeFailed(format!(
                "server GUID must be 32 hex digits, got '{guid}'"
            )));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn local_uid() -> Option<u32> {
    // SAFETY: getuid has no preconditions and cannot fail.
    Some(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn local_uid() -> Option<u32> {
    None
}
