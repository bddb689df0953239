/// Errors produced while parsing signatures or (un)marshalling messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Malformed, overlong or over-nested signature string.
    #[error("invalid signature '{signature}': {reason}")]
    SignatureSyntax { signature: String, reason: String },

    /// Not enough bytes yet. When streaming this means "read more".
    #[error("buffer underrun (needed {needed} bytes, {available} available)")]
    BufferUnderrun { needed: usize, available: usize },

    /// Bytes that cannot be a valid encoding of the declared type.
    #[error("malformed value: {0}")]
    MalformedValue(String),

    /// The message type byte is not one of the four defined kinds.
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),

    /// The header carries a protocol version other than 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// The first header byte is neither `l` nor `B`.
    #[error("invalid endianness marker 0x{0:02x}")]
    InvalidEndianness(u8),

    /// A header field required by the message type is absent.
    #[error("{message_type} message is missing required header field '{field}'")]
    MissingRequiredField {
        message_type: &'static str,
        field: &'static str,
    },

    /// A value does not match the type it is being encoded as.
    #[error("type mismatch: expected '{expected}', found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The body values do not line up with the body signature.
    #[error("body has {values} values but signature '{signature}' describes {types}")]
    BodySignatureMismatch {
        signature: String,
        types: usize,
        values: usize,
    },

    /// The declared message size exceeds the configured maximum.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing messages.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

impl WireError {
    /// True when the failure only means more input is needed.
    pub fn is_underrun(&self) -> bool {
        matches!(self, WireError::BufferUnderrun { .. })
    }

    /// True when the frame was well delimited but semantically rejected, so
    /// the stream itself is still in sync.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            WireError::UnsupportedMessageType(_) | WireError::MissingRequiredField { .. }
        )
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        WireError::MalformedValue(message.into())
    }
}

impl From<dbusprims_transport::TransportError> for WireError {
    fn from(err: dbusprims_transport::TransportError) -> Self {
        use dbusprims_transport::TransportError;
        match err {
            TransportError::Io(io) | TransportError::Accept(io) => WireError::Io(io),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                WireError::Io(source)
            }
            other => WireError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
