use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::address::BusAddress;
use crate::error::{Result, TransportError};

/// A connected byte stream to a D-Bus peer.
///
/// The wire codec only needs ordered delivery and a write primitive, so
/// every transport collapses into this one `Read + Write` type.
pub struct BusStream {
    inner: BusStreamInner,
}

enum BusStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for BusStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.read(buf),
            BusStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for BusStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.write(buf),
            BusStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.flush(),
            BusStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl BusStream {
    /// Connect to the given address (blocking).
    pub fn connect(address: &BusAddress) -> Result<Self> {
        let target = address.to_string();
        let stream = match address {
            #[cfg(unix)]
            BusAddress::Unix { path } => std::os::unix::net::UnixStream::connect(path)
                .map(Self::from_unix)
                .map_err(|source| TransportError::Connect {
                    target: target.clone(),
                    source,
                })?,
            #[cfg(target_os = "linux")]
            BusAddress::UnixAbstract { name } => {
                use std::os::linux::net::SocketAddrExt;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
                    .map_err(|source| TransportError::Connect {
                        target: target.clone(),
                        source,
                    })?;
                std::os::unix::net::UnixStream::connect_addr(&addr)
                    .map(Self::from_unix)
                    .map_err(|source| TransportError::Connect {
                        target: target.clone(),
                        source,
                    })?
            }
            BusAddress::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .map(Self::from_tcp)
                .map_err(|source| TransportError::Connect {
                    target: target.clone(),
                    source,
                })?,
            #[allow(unreachable_patterns)]
            other => {
                return Err(TransportError::UnsupportedTransport(
                    other.transport_name().to_string(),
                ))
            }
        };
        debug!(address = %target, "connected to bus address");
        Ok(stream)
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: BusStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        // Auth lines and small method calls are latency bound.
        let _ = stream.set_nodelay(true);
        Self {
            inner: BusStreamInner::Tcp(stream),
        }
    }

    /// Wrap one end of a connected Unix socket pair.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            BusStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            BusStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Clone the handle so reads and writes can live on separate owners.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            BusStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Transport kind for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(_) => "unix",
            BusStreamInner::Tcp(_) => "tcp",
        }
    }

    /// Credentials of the connected peer as `(uid, gid, pid)`.
    ///
    /// Only Unix sockets on Linux expose these (`SO_PEERCRED`); the server
    /// side of the `EXTERNAL` auth mechanism checks the claimed uid against it.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            BusStreamInner::Unix(stream) => stream.as_raw_fd(),
            BusStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` point to writable storage of the sizes passed,
        // and `fd` is an open socket owned by this stream.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Credentials of the connected peer.
    ///
    /// Always `None` where the platform has no `SO_PEERCRED`.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl std::fmt::Debug for BusStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStream")
            .field("transport", &self.transport_name())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn pair_moves_bytes_both_ways() {
        let (mut left, mut right) = BusStream::pair().unwrap();
        left.write_all(b"AUTH\r\n").unwrap();
        let mut buf = [0u8; 6];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"AUTH\r\n");

        right.write_all(b"OK").unwrap();
        let mut buf = [0u8; 2];
        left.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OK");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pair_reports_own_credentials() {
        let (left, _right) = BusStream::pair().unwrap();
        let (uid, _gid, pid) = left.peer_credentials().unwrap();
        assert_eq!(uid, unsafe { libc::getuid() });
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn tcp_connect_refused_maps_to_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = BusStream::connect(&BusAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn debug_names_transport() {
        let (left, _right) = BusStream::pair().unwrap();
        assert_eq!(format!("{left:?}"), "BusStream { transport: \"unix\" }");
    }
}
