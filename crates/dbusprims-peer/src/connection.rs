use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

use dbusprims_transport::BusStream;
use dbusprims_wire::{
    Message, MessageReader, MessageType, MessageWriter, SerialCounter, WireConfig, WireError,
};
use tracing::{debug, trace, warn};

use crate::error::{PeerError, Result};
use crate::handshake::HandshakeResult;

/// Well-known name, path and interface of the message bus itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Runtime behavior of an authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long [`Connection::call`] waits for the matching reply.
    pub reply_timeout: Duration,
    /// Unrelated messages kept while a call waits for its reply.
    pub max_pending_messages: usize,
    /// Reader/writer settings.
    pub wire: WireConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(25),
            max_pending_messages: 1024,
            wire: WireConfig::default(),
        }
    }
}

/// A connection past the auth handshake, exchanging whole messages.
pub struct Connection {
    reader: MessageReader<BusStream>,
    writer: MessageWriter<BusStream>,
    serials: SerialCounter,
    pending: VecDeque<Message>,
    handshake: HandshakeResult,
    unique_name: Option<String>,
    config: ConnectionConfig,
}

impl Connection {
    /// Build a connection from an authenticated stream.
    ///
    /// Bytes that followed `BEGIN` in the handshake are decoded first.
    pub fn from_parts(
        stream: BusStream,
        mut handshake: HandshakeResult,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let leftover = std::mem::take(&mut handshake.leftover);
        let reader_stream = stream.try_clone()?;
        let reader =
            MessageReader::with_config_stream(reader_stream, config.wire.clone(), &leftover)?;
        let writer = MessageWriter::with_config_stream(stream, config.wire.clone())?;

        Ok(Self {
            reader,
            writer,
            serials: SerialCounter::new(),
            pending: VecDeque::new(),
            handshake,
            unique_name: None,
            config,
        })
    }

    /// Send a message, assigning the next serial if it has none.
    ///
    /// Returns the serial the message went out with.
    pub fn send(&mut self, mut message: Message) -> Result<u32> {
        if message.serial == 0 {
            message.serial = self.serials.next_serial();
        }
        self.writer.write_message(&message).map_err(map_wire_error)?;
        debug!(
            serial = message.serial,
            message_type = message.message_type.name(),
            member = message.member.as_deref().unwrap_or(""),
            "message sent"
        );
        Ok(message.serial)
    }

    /// Send a method call and wait for its reply.
    ///
    /// Other messages arriving meanwhile are queued for [`Connection::recv`].
    /// An `Error` reply is returned as [`PeerError::ErrorReply`].
    pub fn call(&mut self, message: Message) -> Result<Message> {
        let serial = self.send(message)?;
        let timeout = self.config.reply_timeout;
        let deadline = Instant::now() + timeout;

        let outcome = self.wait_for_reply(serial, deadline, timeout);
        self.restore_read_timeout()?;
        let reply = outcome?;

        if reply.message_type == MessageType::Error {
            return Err(PeerError::ErrorReply {
                name: reply.error_name.clone().unwrap_or_default(),
                message: reply.error_text().unwrap_or_default().to_string(),
            });
        }
        Ok(reply)
    }

    fn wait_for_reply(&mut self, serial: u32, deadline: Instant, timeout: Duration) -> Result<Message> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PeerError::Timeout(timeout));
            }
            self.reader.get_ref().set_read_timeout(Some(remaining))?;

            let message = match self.reader.read_message() {
                Ok(message) => message,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => return Err(map_wire_error(err)),
            };

            if message.is_reply_to(serial) {
                trace!(serial, "reply received");
                return Ok(message);
            }
            self.queue(message)?;
        }
    }

    /// Receive the next message, queued ones first (blocking).
    pub fn recv(&mut self) -> Result<Message> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        let message = self.reader.read_message().map_err(map_wire_error)?;
        trace!(
            serial = message.serial,
            message_type = message.message_type.name(),
            "message received"
        );
        Ok(message)
    }

    /// Receive the next message, or `None` if nothing arrives within `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let outcome = match self.reader.read_message() {
            Ok(message) => Ok(Some(message)),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) => Err(map_wire_error(err)),
        };
        self.restore_read_timeout()?;
        outcome
    }

    /// Call `org.freedesktop.DBus.Hello` and remember the unique name it returns.
    pub fn hello(&mut self) -> Result<String> {
        let call = Message::method_call(BUS_PATH, "Hello")?
            .with_interface(BUS_INTERFACE)
            .with_destination(BUS_NAME);
        let reply = self.call(call)?;
        let name = reply
            .body()
            .first()
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                PeerError::HandshakeFailed("Hello reply carried no unique name".to_string())
            })?
            .to_string();
        debug!(unique_name = %name, "registered on bus");
        self.unique_name = Some(name.clone());
        Ok(name)
    }

    /// Unique name from [`Connection::hello`], or the one a listener assigned.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    pub fn set_unique_name(&mut self, name: impl Into<String>) {
        self.unique_name = Some(name.into());
    }

    /// GUID of the server side, as agreed in the handshake.
    pub fn guid(&self) -> &str {
        &self.handshake.guid
    }

    /// Handshake details for this connection.
    pub fn handshake_result(&self) -> &HandshakeResult {
        &self.handshake
    }

    /// Messages queued while waiting for replies.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Allocate a serial without sending anything.
    pub fn next_serial(&self) -> u32 {
        self.serials.next_serial()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn queue(&mut self, message: Message) -> Result<()> {
        if self.pending.len() >= self.config.max_pending_messages {
            warn!(
                limit = self.config.max_pending_messages,
                "pending message buffer full"
            );
            return Err(PeerError::BufferFull {
                limit: self.config.max_pending_messages,
            });
        }
        self.pending.push_back(message);
        Ok(())
    }

    fn restore_read_timeout(&self) -> Result<()> {
        self.reader
            .get_ref()
            .set_read_timeout(self.config.wire.read_timeout)?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name)
            .field("handshake", &self.handshake)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn is_timeout(err: &WireError) -> bool {
    matches!(err, WireError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

fn map_wire_error(err: WireError) -> PeerError {
    match err {
        WireError::ConnectionClosed => PeerError::Disconnected("connection closed by peer".to_string()),
        WireError::Io(io)
            if matches!(io.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) =>
        {
            PeerError::Disconnected(io.to_string())
        }
        other => PeerError::Wire(other),
    }
}
