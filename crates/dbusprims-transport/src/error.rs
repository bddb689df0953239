use std::path::PathBuf;

/// Errors raised while resolving addresses or moving bytes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address string does not follow `transport:key=value,...` syntax.
    #[error("invalid bus address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The address names a transport this crate does not implement.
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),

    /// Failed to bind a listening socket.
    #[error("failed to bind {target}: {source}")]
    Bind {
        target: String,
        source: std::io::Error,
    },

    /// Failed to connect to a listening socket.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for `sockaddr_un`.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
