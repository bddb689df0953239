use std::time::Duration;

use crate::cursor::Endianness;

/// Largest message the protocol allows (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Configuration for message readers, writers and the async codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum total frame size in bytes. Default: 128 MiB.
    pub max_message_size: usize,
    /// Byte order used for outbound messages. Inbound messages carry their own.
    pub endianness: Endianness,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            endianness: Endianness::Little,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
