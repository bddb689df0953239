use dbusprims_transport::{BusAddress, BusStream, TransportError};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::handshake::{handshake_client_with_config, HandshakeConfig, HandshakeResult};

/// Connect and authenticate to the first reachable entry of a D-Bus address.
pub fn connect(address: &str) -> Result<Connection> {
    connect_with_config(address, &HandshakeConfig::default(), ConnectionConfig::default())
}

/// Connect with explicit configuration.
///
/// `address` may list several `;`-separated entries; they are tried in order.
pub fn connect_with_config(
    address: &str,
    handshake_config: &HandshakeConfig,
    connection_config: ConnectionConfig,
) -> Result<Connection> {
    let mut stream = open_first(address)?;
    stream.set_read_timeout(Some(handshake_config.timeout))?;
    stream.set_write_timeout(Some(handshake_config.timeout))?;

    let handshake = handshake_client_with_config(&mut stream, handshake_config)?;
    debug!(guid = %handshake.guid, "authenticated");
    Connection::from_parts(stream, handshake, connection_config)
}

/// Connect without the text handshake, for peers started with auth disabled.
pub fn connect_unauthenticated(address: &str, config: ConnectionConfig) -> Result<Connection> {
    let stream = open_first(address)?;
    Connection::from_parts(stream, HandshakeResult::unauthenticated(None), config)
}

fn open_first(address: &str) -> Result<BusStream> {
    let mut last_error = None;
    for entry in BusAddress::parse_list(address)? {
        match BusStream::connect(&entry) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(address = %entry, error = %err, "address entry unreachable");
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "no entries".to_string(),
        })
        .into())
}
