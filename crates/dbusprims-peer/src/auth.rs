//! Sans-IO state machine for the SASL-style text handshake.
//!
//! Both roles consume raw bytes with [`AuthMachine::feed`] and return the
//! bytes to send back. Once the machine reaches [`AuthState::Complete`] it
//! stops interpreting input: whatever followed the final line is handed out
//! by [`AuthMachine::take_leftover`] for the binary message reader.

use std::fmt;

use crate::error::{PeerError, Result};

/// Default maximum length of one protocol line, terminator excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Client: no `AUTH` outstanding. Server: waiting for `AUTH`.
    AwaitingCommand,
    /// Client: sent `AUTH`, waiting for `OK`. Server: sent `OK`, waiting for `BEGIN`.
    AwaitingOk,
    /// Text phase over. All further bytes are binary messages.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Authentication mechanisms this crate implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Credentials taken from the socket; the client claims a uid.
    External,
    /// No credentials; the initial response is an opaque trace string.
    Anonymous,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "EXTERNAL" => Some(Mechanism::External),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            _ => None,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generate a server GUID: 16 random bytes, hex encoded.
pub fn generate_guid() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// The handshake state machine for one connection.
pub struct AuthMachine {
    role: Role,
    state: AuthState,
    mechanisms: Vec<Mechanism>,
    buf: Vec<u8>,
    seen_first_line: bool,
    max_line_length: usize,
    guid: Option<String>,
    selected: Option<Mechanism>,
    // Client: next index into `mechanisms` to try.
    next_attempt: usize,
    // Client: uid claimed by EXTERNAL. Server: uid reported by the socket.
    uid: Option<u32>,
    anonymous_trace: String,
    client_identity: Option<String>,
}

impl AuthMachine {
    /// Client side. `mechanisms` are tried in order; EXTERNAL is skipped
    /// when `uid` is `None`.
    pub fn client(mechanisms: &[Mechanism], uid: Option<u32>) -> Self {
        Self::new(Role::Client, mechanisms, uid, None)
    }

    /// Server side. `peer_uid` is what the transport reports for the
    /// connected socket, if anything.
    pub fn server(guid: impl Into<String>, mechanisms: &[Mechanism], peer_uid: Option<u32>) -> Self {
        Self::new(Role::Server, mechanisms, peer_uid, Some(guid.into()))
    }

    fn new(role: Role, mechanisms: &[Mechanism], uid: Option<u32>, guid: Option<String>) -> Self {
        Self {
            role,
            state: AuthState::AwaitingCommand,
            mechanisms: mechanisms.to_vec(),
            buf: Vec::new(),
            seen_first_line: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            guid,
            selected: None,
            next_attempt: 0,
            uid,
            anonymous_trace: "dbusprims".to_string(),
            client_identity: None,
        }
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Text the client sends as the ANONYMOUS initial response.
    pub fn with_anonymous_trace(mut self, trace: impl Into<String>) -> Self {
        self.anonymous_trace = trace.into();
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == AuthState::Complete
    }

    /// Server GUID: our own on the server, the one from `OK` on the client.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// The mechanism that succeeded, or the one in flight.
    pub fn mechanism(&self) -> Option<Mechanism> {
        self.selected
    }

    /// Server side: the decoded initial response of the accepted `AUTH`.
    pub fn client_identity(&self) -> Option<&str> {
        self.client_identity.as_deref()
    }

    /// Bytes the client sends first: a NUL credentials byte and the first `AUTH`.
    /// The server sends nothing unprompted.
    pub fn start(&mut self) -> Result<Vec<u8>> {
        match self.role {
            Role::Server => Ok(Vec::new()),
            Role::Client => {
                let mut out = vec![0u8];
                self.send_next_auth(&[], &mut out)?;
                Ok(out)
            }
        }
    }

    /// Consume received bytes and return the response to send, if any.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        while self.state != AuthState::Complete {
            let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_line_length {
                    return Err(PeerError::AuthProtocol(format!(
                        "line exceeds {} bytes",
                        self.max_line_length
                    )));
                }
                break;
            };
            let raw: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = self.decode_line(&raw[..newline])?;
            if line.is_empty() {
                continue;
            }
            match self.role {
                Role::Server => self.server_line(&line, &mut out),
                Role::Client => self.client_line(&line, &mut out)?,
            }
        }
        Ok(out)
    }

    /// Bytes received after the final text line. Empty until complete.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        if self.is_complete() {
            std::mem::take(&mut self.buf)
        } else {
            Vec::new()
        }
    }

    fn decode_line(&mut self, raw: &[u8]) -> Result<String> {
        let mut line = raw.strip_suffix(b"\r").unwrap_or(raw);
        if !self.seen_first_line {
            self.seen_first_line = true;
            let start = line.iter().position(|&b| b != 0).unwrap_or(line.len());
            line = &line[start..];
        }
        if line.len() > self.max_line_length {
            return Err(PeerError::AuthProtocol(format!(
                "line exceeds {} bytes",
                self.max_line_length
            )));
        }
        if !line.is_ascii() {
            return Err(PeerError::AuthProtocol("non-ASCII auth line".to_string()));
        }
        Ok(String::from_utf8_lossy(line).into_owned())
    }

    fn mechanism_list(&self) -> String {
        self.mechanisms
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn server_line(&mut self, line: &str, out: &mut Vec<u8>) {
        let (command, args) = split_command(line);
        match command {
            "AUTH" => self.server_auth(args, out),
            "BEGIN" if self.state == AuthState::AwaitingOk => {
                self.state = AuthState::Complete;
            }
            "BEGIN" => push_line(out, "ERROR \"BEGIN before OK\""),
            "CANCEL" | "ERROR" => {
                self.state = AuthState::AwaitingCommand;
                self.selected = None;
                push_line(out, &format!("REJECTED {}", self.mechanism_list()));
            }
            "NEGOTIATE_UNIX_FD" => push_line(out, "ERROR \"unix fd passing not supported\""),
            _ => push_line(out, "ERROR \"unknown command\""),
        }
    }

    fn server_auth(&mut self, args: &str, out: &mut Vec<u8>) {
        let (name, response) = split_command(args);
        let mechanism = Mechanism::from_name(name).filter(|m| self.mechanisms.contains(m));
        let accepted = match mechanism {
            Some(Mechanism::Anonymous) => Some(decode_response(response).unwrap_or_default()),
            Some(Mechanism::External) => decode_response(response).filter(|claimed| {
                let claimed_uid = claimed.parse::<u32>().ok();
                claimed_uid.is_some() && claimed_uid == self.uid
            }),
            None => None,
        };
        match (mechanism, accepted) {
            (Some(mechanism), Some(identity)) => {
                self.selected = Some(mechanism);
                self.client_identity = Some(identity);
                self.state = AuthState::AwaitingOk;
                let guid = self.guid.clone().unwrap_or_default();
                push_line(out, &format!("OK {guid}"));
            }
            _ => {
                self.state = AuthState::AwaitingCommand;
                push_line(out, &format!("REJECTED {}", self.mechanism_list()));
            }
        }
    }

    fn client_line(&mut self, line: &str, out: &mut Vec<u8>) -> Result<()> {
        let (command, args) = split_command(line);
        match (command, self.state) {
            ("OK", AuthState::AwaitingOk) => {
                if args.is_empty() || hex::decode(args).is_err() {
                    return Err(PeerError::AuthProtocol(format!("malformed OK line '{line}'")));
                }
                self.guid = Some(args.to_string());
                push_line(out, "BEGIN");
                self.state = AuthState::Complete;
            }
            ("REJECTED", _) => {
                self.state = AuthState::AwaitingCommand;
                let offered: Vec<String> = args.split_whitespace().map(str::to_string).collect();
                self.send_next_auth(&offered, out)?;
            }
            ("ERROR", _) | ("DATA", _) => push_line(out, "CANCEL"),
            _ => {
                return Err(PeerError::AuthProtocol(format!(
                    "unexpected line '{line}' in state {:?}",
                    self.state
                )));
            }
        }
        Ok(())
    }

    // Send AUTH for the next local mechanism the server offers. An empty
    // `offered` list means the server has not said anything yet.
    fn send_next_auth(&mut self, offered: &[String], out: &mut Vec<u8>) -> Result<()> {
        while let Some(&mechanism) = self.mechanisms.get(self.next_attempt) {
            self.next_attempt += 1;
            let server_allows =
                offered.is_empty() || offered.iter().any(|name| name == mechanism.name());
            let response = match mechanism {
                Mechanism::Anonymous => Some(self.anonymous_trace.clone()),
                Mechanism::External => self.uid.map(|uid| uid.to_string()),
            };
            if let (true, Some(response)) = (server_allows, response) {
                self.selected = Some(mechanism);
                self.state = AuthState::AwaitingOk;
                push_line(
                    out,
                    &format!("AUTH {} {}", mechanism.name(), hex::encode(response)),
                );
                return Ok(());
            }
        }
        Err(PeerError::AuthRejected {
            mechanisms: offered.to_vec(),
        })
    }
}

impl fmt::Debug for AuthMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMachine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("mechanisms", &self.mechanisms)
            .field("selected", &self.selected)
            .field("guid", &self.guid)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    }
}

fn decode_response(hex_text: &str) -> Option<String> {
    let bytes = hex::decode(hex_text).ok()?;
    String::from_utf8(bytes).ok()
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: &str = "1234deadbeef5678";

    fn server() -> AuthMachine {
        AuthMachine::server(GUID, &[Mechanism::External, Mechanism::Anonymous], Some(1000))
    }

    #[test]
    fn anonymous_then_begin_hands_over_trailing_bytes() {
        let mut server = server();
        let reply = server.feed(b"\0AUTH ANONYMOUS 41424344\r\n").unwrap();
        assert_eq!(reply, b"OK 1234deadbeef5678\r\n");
        assert_eq!(server.state(), AuthState::AwaitingOk);
        assert_eq!(server.client_identity(), Some("ABCD"));

        let reply = server.feed(b"BEGIN\n\x6c\x01").unwrap();
        assert!(reply.is_empty());
        assert!(server.is_complete());
        assert_eq!(server.mechanism(), Some(Mechanism::Anonymous));
        assert_eq!(server.take_leftover(), vec![0x6c, 0x01]);
    }

    #[test]
    fn complete_machine_stops_parsing_lines() {
        let mut server = server();
        server.feed(b"AUTH ANONYMOUS\r\nBEGIN\r\nAUTH ANONYMOUS\r\n").unwrap();
        assert!(server.is_complete());
        assert_eq!(server.take_leftover(), b"AUTH ANONYMOUS\r\n");
    }

    #[test]
    fn split_across_reads() {
        let mut server = server();
        assert!(server.feed(b"AUTH ANONY").unwrap().is_empty());
        assert_eq!(server.state(), AuthState::AwaitingCommand);
        assert_eq!(server.feed(b"MOUS\n").unwrap(), b"OK 1234deadbeef5678\r\n");
    }

    #[test]
    fn unknown_mechanism_is_rejected_and_retry_works() {
        let mut server = server();
        let reply = server.feed(b"AUTH DBUS_COOKIE_SHA1 abcd\r\n").unwrap();
        assert_eq!(reply, b"REJECTED EXTERNAL ANONYMOUS\r\n");
        assert_eq!(server.state(), AuthState::AwaitingCommand);

        let reply = server.feed(b"AUTH ANONYMOUS\r\n").unwrap();
        assert!(reply.starts_with(b"OK "));
    }

    #[test]
    fn external_checks_peer_uid() {
        let mut server = server();
        let wrong = format!("AUTH EXTERNAL {}\r\n", hex::encode("0"));
        assert!(server.feed(wrong.as_bytes()).unwrap().starts_with(b"REJECTED"));

        let right = format!("AUTH EXTERNAL {}\r\n", hex::encode("1000"));
        assert!(server.feed(right.as_bytes()).unwrap().starts_with(b"OK"));
        assert_eq!(server.mechanism(), Some(Mechanism::External));
    }

    #[test]
    fn external_needs_socket_credentials() {
        let mut server = AuthMachine::server(GUID, &[Mechanism::External, Mechanism::Anonymous], None);
        let claim = format!("AUTH EXTERNAL {}\r\n", hex::encode("1000"));
        assert_eq!(
            server.feed(claim.as_bytes()).unwrap(),
            b"REJECTED EXTERNAL ANONYMOUS\r\n"
        );
    }

    #[test]
    fn server_answers_other_commands() {
        let mut server = server();
        assert!(server.feed(b"BEGIN\r\n").unwrap().starts_with(b"ERROR"));
        assert!(server.feed(b"DATA 00\r\n").unwrap().starts_with(b"ERROR"));
        assert!(server
            .feed(b"NEGOTIATE_UNIX_FD\r\n")
            .unwrap()
            .starts_with(b"ERROR"));
        server.feed(b"AUTH ANONYMOUS\r\n").unwrap();
        assert_eq!(
            server.feed(b"CANCEL\r\n").unwrap(),
            b"REJECTED EXTERNAL ANONYMOUS\r\n"
        );
        assert_eq!(server.state(), AuthState::AwaitingCommand);
        assert!(!server.is_complete());
    }

    #[test]
    fn overlong_line_is_a_protocol_error() {
        let mut server = server().with_max_line_length(8);
        assert!(matches!(
            server.feed(b"AUTH ANONYMOUS 0000"),
            Err(PeerError::AuthProtocol(_))
        ));
    }

    #[test]
    fn non_ascii_line_is_a_protocol_error() {
        let mut server = server();
        assert!(matches!(
            server.feed("AUTH ÄNONYMOUS\r\n".as_bytes()),
            Err(PeerError::AuthProtocol(_))
        ));
    }

    #[test]
    fn client_anonymous_flow() {
        let mut client = AuthMachine::client(&[Mechanism::Anonymous], None).with_anonymous_trace("ABCD");
        let first = client.start().unwrap();
        assert_eq!(first, b"\0AUTH ANONYMOUS 41424344\r\n");
        assert_eq!(client.state(), AuthState::AwaitingOk);

        let reply = client.feed(b"OK 1234deadbeef5678\r\n").unwrap();
        assert_eq!(reply, b"BEGIN\r\n");
        assert!(client.is_complete());
        assert_eq!(client.guid(), Some(GUID));
    }

    #[test]
    fn client_falls_back_after_rejection() {
        let mut client = AuthMachine::client(&[Mechanism::External, Mechanism::Anonymous], Some(1000));
        let first = client.start().unwrap();
        assert!(first.starts_with(b"\0AUTH EXTERNAL "));

        let reply = client.feed(b"REJECTED ANONYMOUS\r\n").unwrap();
        assert!(reply.starts_with(b"AUTH ANONYMOUS "));
        assert_eq!(client.mechanism(), Some(Mechanism::Anonymous));
    }

    #[test]
    fn client_runs_out_of_mechanisms() {
        let mut client = AuthMachine::client(&[Mechanism::Anonymous], None);
        client.start().unwrap();
        let err = client.feed(b"REJECTED EXTERNAL\r\n").unwrap_err();
        match err {
            PeerError::AuthRejected { mechanisms } => assert_eq!(mechanisms, vec!["EXTERNAL"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn client_cancels_on_error() {
        let mut client = AuthMachine::client(&[Mechanism::Anonymous], None);
        client.start().unwrap();
        assert_eq!(client.feed(b"ERROR \"nope\"\r\n").unwrap(), b"CANCEL\r\n");
    }

    #[test]
    fn client_rejects_garbage() {
        let mut client = AuthMachine::client(&[Mechanism::Anonymous], None);
        client.start().unwrap();
        assert!(matches!(
            client.feed(b"HELLO\r\n"),
            Err(PeerError::AuthProtocol(_))
        ));
    }

    #[test]
    fn machines_talk_to_each_other() {
        let mut client = AuthMachine::client(&[Mechanism::External, Mechanism::Anonymous], Some(7));
        let mut server = AuthMachine::server(generate_guid(), &[Mechanism::Anonymous], Some(7));

        let mut to_server = client.start().unwrap();
        while !(client.is_complete() && server.is_complete()) {
            let to_client = server.feed(&to_server).unwrap();
            to_server = client.feed(&to_client).unwrap();
        }
        assert_eq!(client.guid(), server.guid());
        assert_eq!(client.mechanism(), Some(Mechanism::Anonymous));
        assert_eq!(server.guid().map(str::len), Some(32));
    }
}
