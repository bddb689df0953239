use std::sync::atomic::{AtomicU64, Ordering};

use dbusprims_transport::{BusAddress, BusListener};
use tracing::info;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::handshake::{handshake_server_with_config, HandshakeConfig, HandshakeResult};

/// Listens for clients, authenticates them and names them `:1.N`.
pub struct ConnectionListener {
    listener: BusListener,
    handshake_config: HandshakeConfig,
    connection_config: ConnectionConfig,
    require_auth: bool,
    next_id: AtomicU64,
}

impl ConnectionListener {
    /// Bind to a D-Bus address such as `unix:path=/tmp/bus` or `tcp:host=127.0.0.1,port=0`.
    pub fn bind(address: &str) -> Result<Self> {
        let address = BusAddress::parse(address)?;
        Ok(Self::from_listener(BusListener::bind(&address)?))
    }

    /// Wrap an already bound transport listener.
    pub fn from_listener(listener: BusListener) -> Self {
        Self {
            listener,
            handshake_config: HandshakeConfig::default(),
            connection_config: ConnectionConfig::default(),
            require_auth: true,
            next_id: AtomicU64::new(1),
        }
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Override connection config for accepted peers.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Skip the text handshake: clients speak binary messages immediately.
    pub fn without_auth(mut self) -> Self {
        self.require_auth = false;
        self
    }

    /// Accept the next client, run the server handshake and assign a unique name.
    pub fn accept(&self) -> Result<Connection> {
        let mut stream = self.listener.accept()?;

        let handshake = if self.require_auth {
            stream.set_read_timeout(Some(self.handshake_config.timeout))?;
            stream.set_write_timeout(Some(self.handshake_config.timeout))?;
            let peer_uid = stream.peer_credentials().map(|(uid, _gid, _pid)| uid);
            handshake_server_with_config(&mut stream, peer_uid, &self.handshake_config)?
        } else {
            HandshakeResult::unauthenticated(self.handshake_config.server_guid.clone())
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(":1.{id}");
        info!(unique_name = %name, mechanism = %handshake.mechanism, "client connected");

        let mut connection = Connection::from_parts(stream, handshake, self.connection_config.clone())?;
        connection.set_unique_name(name);
        Ok(connection)
    }

    /// Address clients should connect to.
    pub fn address(&self) -> &BusAddress {
        self.listener.address()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use crate::connector::{connect, connect_unauthenticated};

    fn make_sock_address(tag: &str) -> (PathBuf, String) {
        let dir = PathBuf::from(format!(
            "/tmp/dbusp-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let address = format!("unix:path={}", dir.join("bus.sock").display());
        (dir, address)
    }

    #[test]
    fn accept_assigns_unique_names() {
        let (dir, address) = make_sock_address("names");
        let listener = ConnectionListener::bind(&address).expect("listener should bind");

        let server = thread::spawn(move || {
            let first = listener.accept().expect("first accept should succeed");
            let second = listener.accept().expect("second accept should succeed");
            assert_eq!(first.unique_name(), Some(":1.1"));
            assert_eq!(second.unique_name(), Some(":1.2"));
        });

        let _c1 = connect(&address).expect("first client should connect");
        let _c2 = connect(&address).expect("second client should connect");
        server.join().expect("server thread should finish");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn guid_matches_on_both_sides() {
        let (dir, address) = make_sock_address("guid");
        let guid = "00112233445566778899aabbccddeeff";
        let listener = ConnectionListener::bind(&address)
            .expect("listener should bind")
            .with_handshake_config(HandshakeConfig {
                server_guid: Some(guid.to_string()),
                ..HandshakeConfig::default()
            });

        let server = thread::spawn(move || {
            let conn = listener.accept().expect("listener should accept");
            assert_eq!(conn.guid(), guid);
        });

        let client = connect(&address).expect("client should connect");
        assert_eq!(client.guid(), guid);
        server.join().expect("server thread should finish");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn tcp_listener_without_auth() {
        let listener = ConnectionListener::bind("tcp:host=127.0.0.1,port=0")
            .expect("listener should bind")
            .without_auth();
        let address = listener.address().to_string();

        let server = thread::spawn(move || {
            let mut conn = listener.accept().expect("listener should accept");
            let call = conn.recv().expect("should receive call");
            let reply = dbusprims_wire::Message::method_return(&call);
            conn.send(reply).expect("should reply");
        });

        let mut client = connect_unauthenticated(&address, ConnectionConfig::default())
            .expect("client should connect");
        let call = dbusprims_wire::Message::method_call("/", "Ping").expect("valid call");
        let reply = client.call(call).expect("call should succeed");
        assert_eq!(reply.reply_serial, Some(1));
        server.join().expect("server thread should finish");
    }
}
