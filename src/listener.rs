use pin_project::pin_project;
use serde::Deserialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

#[derive(Error, Debug)]
pub enum ListenAddrError {
    #[error("Unknown listen protocol {0:?}, expected tcp or unix.")]
    Protocol(String),
    #[error("Invalid socket address {0:?}.")]
    Address(String),
}

/// Where a fresh listener binds.
///
/// Parsed from `tcp:127.0.0.1:48879`, `unix:/run/app.sock`, or a bare
/// `host:port` which means TCP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let addr = match s.split_once(':') {
            Some(("tcp", rest)) => rest,
            Some((proto, rest)) if rest.contains(':') && !proto.contains('[') => {
                return Err(ListenAddrError::Protocol(proto.to_string()));
            }
            _ => s,
        };

        addr.parse()
            .map(Self::Tcp)
            .map_err(|_| ListenAddrError::Address(addr.to_string()))
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = ListenAddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Remote end of an accepted connection.
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{}", addr),
            Self::Unix(Some(path)) => write!(f, "{}", path.display()),
            Self::Unix(None) => f.write_str("(unnamed)"),
        }
    }
}

/// A listening stream socket, TCP or Unix.
///
/// The OS descriptor is reachable through [`AsRawFd`]; nothing else in the
/// crate needs to know how tokio stores it.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a fresh listener. TCP sockets get `SO_REUSEPORT` so a successor
    /// that falls back to binding can coexist with a predecessor that is
    /// still draining.
    pub fn bind(addr: &ListenAddr, backlog: i32) -> io::Result<Self> {
        match addr {
            ListenAddr::Tcp(addr) => {
                let socket = create_listener_socket(*addr, backlog)?;
                Ok(Self::Tcp(TcpListener::from_std(socket.into())?))
            }
            ListenAddr::Unix(path) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }

                let socket = Socket::new(Domain::UNIX, Type::STREAM.nonblocking().cloexec(), None)?;
                socket.bind(&SockAddr::unix(path)?)?;
                socket.listen(backlog)?;

                Ok(Self::Unix(UnixListener::from_std(socket.into())?))
            }
        }
    }

    /// Adopt an already listening socket, choosing the variant from its
    /// address family.
    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        let domain = socket.local_addr()?.domain();
        socket.set_nonblocking(true)?;

        if domain == Domain::IPV4 || domain == Domain::IPV6 {
            Ok(Self::Tcp(TcpListener::from_std(socket.into())?))
        } else if domain == Domain::UNIX {
            Ok(Self::Unix(UnixListener::from_std(socket.into())?))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is neither TCP nor Unix",
            ))
        }
    }

    pub async fn accept(&self) -> io::Result<(Connection, PeerAddr)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), PeerAddr::Tcp(peer)))
            }
            Self::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let path = peer.as_pathname().map(|p| p.to_path_buf());
                Ok((Connection::Unix(stream), PeerAddr::Unix(path)))
            }
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(ListenAddr::Tcp),
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().map(|p| p.to_path_buf()).unwrap_or_default();
                Ok(ListenAddr::Unix(path))
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

/// An accepted stream from either kind of listener.
#[pin_project(project = ConnectionProj)]
#[derive(Debug)]
pub enum Connection {
    Tcp(#[pin] TcpStream),
    Unix(#[pin] UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp(s) => s.poll_read(cx, buf),
            ConnectionProj::Unix(s) => s.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ConnectionProj::Tcp(s) => s.poll_write(cx, buf),
            ConnectionProj::Unix(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp(s) => s.poll_flush(cx),
            ConnectionProj::Unix(s) => s.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp(s) => s.poll_shutdown(cx),
            ConnectionProj::Unix(s) => s.poll_shutdown(cx),
        }
    }
}

fn create_listener_socket(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(..) => Domain::IPV4,
        SocketAddr::V6(..) => Domain::IPV6,
    };

    let socket = Socket::new(
        domain,
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}
