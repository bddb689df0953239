//! Authenticated D-Bus peer connections.
//!
//! This is the "just works" layer over the wire codec: run the text auth
//! handshake, then exchange whole messages with serial allocation and
//! reply matching.
//!
//! ```no_run
//! use dbusprims_peer::connect;
//! use dbusprims_wire::Message;
//!
//! # fn main() -> dbusprims_peer::Result<()> {
//! let mut conn = connect("unix:path=/run/user/1000/bus")?;
//! conn.hello()?;
//! let call = Message::method_call("/org/freedesktop/DBus", "GetId")?
//!     .with_interface("org.freedesktop.DBus")
//!     .with_destination("org.freedesktop.DBus");
//! let reply = conn.call(call)?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connection;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod listener;

pub use auth::{generate_guid, AuthMachine, AuthState, Mechanism, Role};
pub use connection::{Connection, ConnectionConfig, BUS_INTERFACE, BUS_NAME, BUS_PATH};
pub use connector::{connect, connect_unauthenticated, connect_with_config};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_client, handshake_client_with_config, handshake_server, handshake_server_with_config,
    HandshakeConfig, HandshakeResult,
};
pub use listener::ConnectionListener;
