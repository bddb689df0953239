use std::time::Duration;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] dbusprims_transport::TransportError),

    /// Message encoding or decoding error.
    #[error("wire error: {0}")]
    Wire(#[from] dbusprims_wire::WireError),

    /// The server rejected every mechanism this side was willing to try.
    #[error("authentication rejected (server offers: {})", format_mechanisms(.mechanisms))]
    AuthRejected { mechanisms: Vec<String> },

    /// The other side broke the line protocol.
    #[error("auth protocol violation: {0}")]
    AuthProtocol(String),

    /// Handshake failed for a reason other than rejection.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Too many unrelated messages arrived while waiting for a reply.
    #[error("pending message buffer full ({limit} messages)")]
    BufferFull { limit: usize },

    /// The peer answered a method call with an error message.
    #[error("{name}: {message}")]
    ErrorReply { name: String, message: String },
}

fn format_mechanisms(mechanisms: &[String]) -> String {
    if mechanisms.is_empty() {
        "none".to_string()
    } else {
        mechanisms.join(" ")
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
