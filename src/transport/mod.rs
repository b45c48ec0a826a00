//! Authenticated request/response channel between hub and agents.
//!
//! Runs over TCP or a unix socket. The only operation is "return a stats
//! snapshot"; everything else in this module is plumbing for getting there
//! safely.

mod auth;
mod client;
mod frame;

pub use auth::*;
pub use client::*;
pub use frame::*;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent rejected authentication")]
    Rejected,
    #[error("agent fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

impl TransportError {
    /// True when the peer closed or reset the connection.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            )
        )
    }
}

/// Socket family an agent listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    /// Guess the network from an address: absolute paths are unix sockets.
    pub fn detect(addr: &str) -> Self {
        if addr.starts_with('/') {
            Network::Unix
        } else {
            Network::Tcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unsupported network: {}", other)),
        }
    }
}

/// A bidirectional byte stream, TCP or unix.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Turn a listen-style address into something dialable: `45876` and
/// `:45876` mean the local machine.
pub fn dial_address(addr: &str) -> String {
    if addr.chars().all(|c| c.is_ascii_digit()) && !addr.is_empty() {
        format!("127.0.0.1:{}", addr)
    } else if let Some(port) = addr.strip_prefix(':') {
        format!("127.0.0.1:{}", port)
    } else {
        addr.to_string()
    }
}

/// Turn a listen-style address into a bindable one: `45876` and `:45876`
/// mean every interface.
pub fn bind_address(addr: &str) -> String {
    if addr.chars().all(|c| c.is_ascii_digit()) && !addr.is_empty() {
        format!("0.0.0.0:{}", addr)
    } else if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// Open a bare connection to an agent.
pub async fn dial(network: Network, addr: &str) -> io::Result<Box<dyn Conn>> {
    match network {
        Network::Tcp => {
            let stream = TcpStream::connect(dial_address(addr)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Network::Unix => Ok(Box::new(tokio::net::UnixStream::connect(addr).await?)),
        #[cfg(not(unix))]
        Network::Unix => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

/// A bound agent listener.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl Listener {
    /// Bind the given network/address. A stale unix socket file is removed
    /// first.
    pub async fn bind(network: Network, addr: &str) -> io::Result<Self> {
        match network {
            Network::Tcp => Ok(Listener::Tcp(TcpListener::bind(bind_address(addr)).await?)),
            #[cfg(unix)]
            Network::Unix => {
                let path = std::path::PathBuf::from(addr);
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                Ok(Listener::Unix(tokio::net::UnixListener::bind(&path)?, path))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }

    /// Accept one connection, returning it with a printable peer label.
    pub async fn accept(&self) -> io::Result<(Box<dyn Conn>, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// Local address, for logs and tests.
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            Listener::Unix(_, path) => path.display().to_string(),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
