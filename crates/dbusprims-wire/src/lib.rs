//! The D-Bus binary message format.
//!
//! Layers, leaves first:
//! - [`signature`]: the type mini-language (`ybnqiuxtdsogv a ( ) { }`)
//! - [`cursor`]: byte-order aware reads and writes at aligned offsets
//! - [`value`], [`variant`], [`codec`]: dynamically typed values and their encoding
//! - [`message`], [`marshal`]: the header/body envelope and its wire layout
//! - [`reader`], [`writer`]: whole-message blocking I/O over any byte stream
//!
//! The codec modules never perform I/O or log. They return
//! [`WireError::BufferUnderrun`] when input is short, which streaming callers
//! treat as "read more".

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod error;
pub mod marshal;
pub mod message;
pub mod reader;
pub mod serial;
pub mod signature;
pub mod value;
pub mod variant;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::MessageCodec;
pub use codec::{decode_value, decode_values, encode_value, encode_values, MAX_ARRAY_LEN};
pub use config::{WireConfig, MAX_MESSAGE_SIZE};
pub use cursor::{padding_for, Endianness, ReadCursor, WriteCursor};
pub use error::{Result, WireError};
pub use marshal::{
    encode_message, marshal, message_frame_length, try_decode_message, unmarshal, HEADER_LEN,
};
pub use message::{
    HeaderField, Message, MessageType, FLAG_ALLOW_INTERACTIVE_AUTHORIZATION, FLAG_NO_AUTO_START,
    FLAG_NO_REPLY_EXPECTED, PROTOCOL_VERSION,
};
pub use reader::MessageReader;
pub use serial::SerialCounter;
pub use signature::{parse_signature, parse_single_type, signature_string, Signature, TypeNode};
pub use value::{Dict, ObjectPath, Value};
pub use variant::Variant;
pub use writer::MessageWriter;
