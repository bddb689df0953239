use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::WireConfig;
use crate::error::WireError;
use crate::marshal::{encode_message, try_decode_message};
use crate::message::Message;

/// `tokio_util` codec producing and consuming whole [`Message`]s.
///
/// Wrap an async byte stream with `Framed::new(stream, MessageCodec::new())`
/// once the auth handshake has finished. Any bytes left over from the
/// handshake must be pushed into the framed read buffer first.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: WireConfig,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: WireConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WireConfig {
        &self.config
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        try_decode_message(src, self.config.max_message_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        Encoder::<&Message>::encode(self, &message, dst)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), WireError> {
        let start = dst.len();
        encode_message(message, self.config.endianness, dst)?;
        let size = dst.len() - start;
        if size > self.config.max_message_size {
            dst.truncate(start);
            return Err(WireError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::value::Value;

    fn call(serial: u32) -> Message {
        Message::method_call("/org/example", "Echo")
            .unwrap()
            .with_serial(serial)
            .with_body("as", vec![Value::array(["a", "b"])])
            .unwrap()
    }

    #[test]
    fn decode_waits_and_eof_reports_truncation() {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        Encoder::<&Message>::encode(&mut codec, &call(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(WireError::ConnectionClosed)
        ));

        let decoded = codec.decode(&mut full).unwrap().unwrap();
        assert_eq!(decoded, call(1));
        assert!(codec.decode_eof(&mut full).unwrap().is_none());
    }

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sink = FramedWrite::new(client, MessageCodec::new());
        let mut stream = FramedRead::new(server, MessageCodec::new());

        sink.send(call(1)).await.unwrap();
        sink.send(call(2)).await.unwrap();
        drop(sink);

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((first.serial, second.serial), (1, 2));
        assert!(stream.next().await.is_none());
    }
}
