//! Byte transports for D-Bus peers.
//!
//! Resolves D-Bus address strings (`unix:path=...`, `tcp:host=...,port=...`)
//! and provides blocking streams and listeners over them. Nothing here knows
//! about the message format; higher layers only need ordered bytes in and a
//! write primitive out, which [`BusStream`] supplies.

pub mod address;
pub mod error;
pub mod listener;
pub mod stream;

pub use address::BusAddress;
pub use error::{Result, TransportError};
pub use listener::{BusListener, DEFAULT_SOCKET_MODE};
pub use stream::BusStream;
