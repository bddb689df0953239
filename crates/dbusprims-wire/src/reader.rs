use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use dbusprims_transport::BusStream;
use tracing::trace;

use crate::config::WireConfig;
use crate::error::{Result, WireError};
use crate::marshal::try_decode_message;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete messages from any `Read` stream.
///
/// Handles partial reads internally. Callers always get whole messages.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    config: WireConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    /// Create a new message reader with explicit configuration.
    pub fn with_config(inner: T, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Create a reader that first consumes `leftover`, the bytes that arrived
    /// in the same read as the end of the auth handshake.
    pub fn with_leftover(inner: T, config: WireConfig, leftover: &[u8]) -> Self {
        let mut reader = Self::with_config(inner, config);
        reader.buf.extend_from_slice(leftover);
        reader
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(WireError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = try_decode_message(&mut self.buf, self.config.max_message_size)? {
                trace!(
                    serial = message.serial,
                    message_type = message.message_type.name(),
                    "message decoded"
                );
                return Ok(message);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };

            if read == 0 {
                return Err(WireError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet decoded into a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum message size for subsequent decoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.config.max_message_size = max_message_size;
    }

    /// Current reader configuration.
    pub fn config(&self) -> &WireConfig {
        &self.config
    }
}

impl MessageReader<BusStream> {
    /// Create a reader for a `BusStream`, applying the configured read timeout.
    pub fn with_config_stream(inner: BusStream, config: WireConfig, leftover: &[u8]) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_leftover(inner, config, leftover))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::cursor::Endianness;
    use crate::marshal::marshal;
    use crate::value::Value;

    fn call(serial: u32) -> Message {
        Message::method_call("/org/example", "Echo")
            .unwrap()
            .with_serial(serial)
            .with_body("s", vec![Value::from(format!("msg-{serial}"))])
            .unwrap()
    }

    fn wire(messages: &[Message]) -> Vec<u8> {
        let mut out = Vec::new();
        for message in messages {
            out.extend_from_slice(&marshal(message, Endianness::Little).unwrap());
        }
        out
    }

    #[test]
    fn read_multiple_messages() {
        let mut reader = MessageReader::new(Cursor::new(wire(&[call(1), call(2), call(3)])));
        for serial in 1..=3 {
            let message = reader.read_message().unwrap();
            assert_eq!(message.serial, serial);
            assert_eq!(message.body()[0].as_str(), Some(format!("msg-{serial}").as_str()));
        }
        assert!(matches!(
            reader.read_message(),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[call(4)]),
            pos: 0,
        };
        let mut reader = MessageReader::new(byte_reader);
        assert_eq!(reader.read_message().unwrap().serial, 4);
    }

    #[test]
    fn leftover_bytes_are_decoded_first() {
        let bytes = wire(&[call(1), call(2)]);
        let split = bytes.len() / 2 + 3;
        let mut reader = MessageReader::with_leftover(
            Cursor::new(bytes[split..].to_vec()),
            WireConfig::default(),
            &bytes[..split],
        );
        assert_eq!(reader.read_message().unwrap().serial, 1);
        assert_eq!(reader.read_message().unwrap().serial, 2);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn connection_closed_mid_message() {
        let bytes = wire(&[call(1)]);
        let mut reader = MessageReader::new(Cursor::new(bytes[..bytes.len() - 3].to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_message_in_stream() {
        let config = WireConfig {
            max_message_size: 32,
            ..WireConfig::default()
        };
        let mut reader = MessageReader::with_config(Cursor::new(wire(&[call(1)])), config);
        assert!(matches!(
            reader.read_message(),
            Err(WireError::MessageTooLarge { max: 32, .. })
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: wire(&[call(8)]),
            pos: 0,
        };
        let mut reader = MessageReader::new(reader);
        assert_eq!(reader.read_message().unwrap().serial, 8);
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = BusStream::pair().unwrap();
        let mut writer = crate::writer::MessageWriter::new(left);
        let mut reader =
            MessageReader::with_config_stream(right, WireConfig::default(), &[]).unwrap();

        writer.write_message(&call(11)).unwrap();
        let message = reader.read_message().unwrap();
        assert_eq!(message, call(11));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
