//! D-Bus wire protocol primitives with permissive licensing.
//!
//! dbusprims implements the D-Bus binary message format and the pieces
//! needed to speak it over a socket: address parsing, the SASL-style auth
//! handshake, and blocking peer connections. It is not a bus daemon.
//!
//! # Crate Structure
//!
//! - [`transport`]: addresses and byte streams (Unix sockets, TCP)
//! - [`wire`]: signatures, values, variants, message marshalling
//! - [`peer`]: auth handshake and connections (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use dbusprims_transport::*;
}

/// Re-export wire format types.
pub mod wire {
    pub use dbusprims_wire::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use dbusprims_peer::*;
}
