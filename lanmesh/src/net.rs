//! Network provider abstraction.
//!
//! Trait-based networking so the peer can run over real Tokio TCP or
//! any substitute transport a test harness provides.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for dialing peers and listening for them.
///
/// Single-core design, so no `Send` bounds. `Clone` lets one provider
/// back every connection of a peer.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// Bidirectional byte stream for this provider.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// Listener type for this provider.
    type Listener: Listener<Stream = Self::Stream> + 'static;

    /// Bind a listener on the given address.
    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Listener>;

    /// Open a stream to a remote address.
    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Stream>;
}

/// A bound listener accepting incoming streams.
#[async_trait(?Send)]
pub trait Listener {
    /// Stream type produced by `accept`.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept one incoming stream and its remote address.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// The locally bound address (resolves port 0 to the real port).
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Real Tokio TCP networking.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type Stream = tokio::net::TcpStream;
    type Listener = TokioListener;

    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Listener> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioListener { inner })
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Stream> {
        tokio::net::TcpStream::connect(addr).await
    }
}

/// Wrapper implementing [`Listener`] for the Tokio TCP listener.
#[derive(Debug)]
pub struct TokioListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl Listener for TokioListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        self.inner.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
