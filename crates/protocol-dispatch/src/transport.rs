//! Target addresses and the outbound connect boundary.
//!
//! Any [`tower::Service`] taking a [`SocketAddr`] and yielding an async I/O
//! stream can serve as a [`Connector`], which is the shape of
//! `tower::make::MakeConnection`. [`TcpConnector`] is the default.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use protocol_dispatch_core::DispatchError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tower::{Service, ServiceExt};

/// A bidirectional byte stream handed to channel initializers.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection stream.
pub type BoxIo = Box<dyn AsyncIo>;

/// Opens outbound connections.
///
/// Implemented for every cloneable `tower::Service<SocketAddr>` whose
/// response is an [`AsyncIo`] and whose error is an [`io::Error`].
pub trait Connector: Send + Sync + 'static {
    /// Connects to `addr`.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxIo>>;
}

impl<S> Connector for S
where
    S: Service<SocketAddr, Error = io::Error> + Clone + Send + Sync + 'static,
    S::Response: AsyncIo,
    S::Future: Send + 'static,
{
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxIo>> {
        let svc = self.clone();
        Box::pin(async move {
            let io = svc.oneshot(addr).await?;
            Ok(Box::new(io) as BoxIo)
        })
    }
}

/// Connects over TCP with `TCP_NODELAY` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    _priv: (),
}

impl TcpConnector {
    /// Creates a TCP connector.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service<SocketAddr> for TcpConnector {
    type Response = TcpStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, addr: SocketAddr) -> Self::Future {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// Where a client connects to.
///
/// An unresolved address is looked up again before every connect, so a
/// reconnecting client follows DNS changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A fixed socket address.
    Resolved(SocketAddr),
    /// A host name resolved at connect time.
    Unresolved {
        /// Host name or textual IP.
        host: String,
        /// Port number.
        port: u16,
    },
}

impl Address {
    /// Creates an address resolved at connect time.
    pub fn unresolved(host: impl Into<String>, port: u16) -> Self {
        Address::Unresolved {
            host: host.into(),
            port,
        }
    }

    /// Returns `true` if this address needs a lookup before connecting.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Address::Unresolved { .. })
    }

    /// Produces the socket address to connect to.
    pub async fn resolve(&self) -> Result<SocketAddr, DispatchError> {
        match self {
            Address::Resolved(addr) => Ok(*addr),
            Address::Unresolved { host, port } => {
                let mut addrs = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| DispatchError::resolve(host.clone(), e))?;
                addrs.next().ok_or_else(|| {
                    DispatchError::resolve(
                        host.clone(),
                        io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
                    )
                })
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Resolved(addr)
    }
}

impl FromStr for Address {
    type Err = io::Error;

    /// Parses `ip:port` into a resolved address and `host:port` into an
    /// unresolved one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Resolved(addr));
        }
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address: {s}"));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Address::unresolved(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Resolved(addr) => write!(f, "{addr}"),
            Address::Unresolved { host, port } => write!(f, "{host}:{port}"),
        }
    }
}
