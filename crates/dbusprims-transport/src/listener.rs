use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::address::BusAddress;
use crate::error::{Result, TransportError};
use crate::stream::BusStream;

/// Default permission mode for created socket paths.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// `sockaddr_un.sun_path` capacity: 108 bytes on Linux, 104 elsewhere.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// A listening socket that yields [`BusStream`]s.
///
/// Filesystem Unix sockets are created with mode `0600`, replace a stale
/// socket left at the same path, and are removed on drop as long as the
/// path still refers to the socket this listener created.
pub struct BusListener {
    inner: ListenerInner,
    address: BusAddress,
}

enum ListenerInner {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: Option<PathBuf>,
        created_inode: Option<(u64, u64)>,
    },
    Tcp(TcpListener),
}

impl BusListener {
    /// Bind and listen on `address`.
    ///
    /// For `tcp:` addresses with `port=0` the resolved port is reflected in
    /// [`BusListener::address`].
    pub fn bind(address: &BusAddress) -> Result<Self> {
        match address {
            #[cfg(unix)]
            BusAddress::Unix { path } => Self::bind_unix_path(path, DEFAULT_SOCKET_MODE),
            #[cfg(target_os = "linux")]
            BusAddress::UnixAbstract { name } => Self::bind_unix_abstract(name),
            BusAddress::Tcp { host, port } => Self::bind_tcp(host, *port),
            #[allow(unreachable_patterns)]
            other => Err(TransportError::UnsupportedTransport(
                other.transport_name().to_string(),
            )),
        }
    }

    /// Bind a filesystem Unix socket with an explicit permission mode.
    #[cfg(unix)]
    pub fn bind_unix_path(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let target = path.display().to_string();
        let bind_err = |source| TransportError::Bind {
            target: target.clone(),
            source,
        };

        let path_len = path.as_os_str().len();
        if path_len >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_len,
                max: MAX_PATH_LEN,
            });
        }

        // Only ever unlink something that is itself a socket.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix socket");

        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path: Some(path.clone()),
                created_inode: Some((created.dev(), created.ino())),
            },
            address: BusAddress::Unix { path },
        })
    }

    #[cfg(target_os = "linux")]
    fn bind_unix_abstract(name: &str) -> Result<Self> {
        use std::os::linux::net::SocketAddrExt;

        let target = format!("unix:abstract={name}");
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).map_err(
            |source| TransportError::Bind {
                target: target.clone(),
                source,
            },
        )?;
        let listener =
            UnixListener::bind_addr(&addr).map_err(|source| TransportError::Bind { target, source })?;

        info!(name, "listening on abstract unix socket");

        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path: None,
                created_inode: None,
            },
            address: BusAddress::UnixAbstract {
                name: name.to_string(),
            },
        })
    }

    fn bind_tcp(host: &str, port: u16) -> Result<Self> {
        let target = format!("{host}:{port}");
        let listener = TcpListener::bind((host, port)).map_err(|source| TransportError::Bind {
            target: target.clone(),
            source,
        })?;
        let local = listener.local_addr()?;

        info!(%local, "listening on tcp");

        Ok(Self {
            inner: ListenerInner::Tcp(listener),
            address: BusAddress::Tcp {
                host: host.to_string(),
                port: local.port(),
            },
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<BusStream> {
        let stream = match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                BusStream::from_unix(stream)
            }
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%peer, "accepted tcp connection");
                BusStream::from_tcp(stream)
            }
        };
        debug!(transport = stream.transport_name(), "accepted connection");
        Ok(stream)
    }

    /// The address clients should connect to.
    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    /// Filesystem path of a Unix listener, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix { path, .. } => path.as_deref(),
            ListenerInner::Tcp(_) => None,
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerInner::Unix {
            path: Some(path),
            created_inode: Some((expected_dev, expected_ino)),
            ..
        } = &self.inner
        {
            if let Ok(metadata) = std::fs::symlink_metadata(path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == *expected_dev
                    && metadata.ino() == *expected_ino
                {
                    debug!(?path, "removing socket file");
                    let _ = std::fs::remove_file(path);
                } else {
                    debug!(?path, "socket path was replaced; leaving it alone");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dbusprims-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect_unix() {
        let dir = temp_dir("listen-unix");
        let address = BusAddress::Unix {
            path: dir.join("bus.sock"),
        };

        let listener = BusListener::bind(&address).unwrap();
        assert!(dir.join("bus.sock").exists());

        let client_address = listener.address().clone();
        let handle = std::thread::spawn(move || {
            let mut client = BusStream::connect(&client_address).unwrap();
            client.write_all(b"\0AUTH").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\0AUTH");
        handle.join().unwrap();

        drop(listener);
        assert!(!dir.join("bus.sock").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tcp_port_zero_resolves() {
        let listener = BusListener::bind(&BusAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .unwrap();
        let BusAddress::Tcp { port, .. } = listener.address() else {
            panic!("expected tcp address");
        };
        assert_ne!(*port, 0);
        assert!(listener.path().is_none());

        let address = listener.address().clone();
        let handle = std::thread::spawn(move || {
            let mut client = BusStream::connect(&address).unwrap();
            client.write_all(b"BEGIN\r\n").unwrap();
        });
        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"BEGIN\r\n");
        handle.join().unwrap();
    }

    #[test]
    fn path_too_long_rejected() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = BusListener::bind_unix_path(&long_path, DEFAULT_SOCKET_MODE);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn default_permissions_are_owner_only() {
        let dir = temp_dir("listen-perms");
        let sock_path = dir.join("perm.sock");

        let listener = BusListener::bind_unix_path(&sock_path, DEFAULT_SOCKET_MODE).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = temp_dir("listen-file");
        let sock_path = dir.join("not-a-socket");
        std::fs::write(&sock_path, b"regular").unwrap();

        let result = BusListener::bind_unix_path(&sock_path, DEFAULT_SOCKET_MODE);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_keeps_replaced_path() {
        let dir = temp_dir("listen-replaced");
        let sock_path = dir.join("drop.sock");

        let listener = BusListener::bind_unix_path(&sock_path, DEFAULT_SOCKET_MODE).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement").unwrap();

        drop(listener);
        assert!(sock_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
