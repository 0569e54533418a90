//! The seam between connection establishment (this crate) and the wire
//! protocols that run on an established connection (collaborators).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::edge_addrs::EdgeAddr;
use crate::fuse::ConnectedFuse;
use crate::{QuicConnection, Tag};

/// Byte stream to the edge; concretely a TLS-wrapped TCP connection, a
/// duplex pipe in tests.
pub trait EdgeStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> EdgeStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Datagram protocol spoken inside a quic connection, snapshotted from
/// the account's feature set at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramVersion {
    V2,
    V3,
}

/// Everything a session needs to know about the attempt it serves.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub conn_index: u8,
    pub edge_addr: EdgeAddr,
    /// Retries consumed by this index so far; the edge uses it to
    /// distinguish fresh registrations from reconnects.
    pub previous_attempts: u32,
    pub datagram_version: DatagramVersion,
    pub tags: Vec<Tag>,
    pub rpc_timeout: Duration,
    pub write_stream_timeout: Duration,
    pub grace_period: Duration,
}

/// Runs the wire protocol for one established connection.
///
/// Implementations must latch `fuse.connected()` once the control stream
/// completed registration and should drain within the grace period when
/// `graceful_shutdown` fires.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    async fn run_http2(
        &self,
        stream: Box<dyn EdgeStream>,
        options: ConnectionOptions,
        fuse: Arc<ConnectedFuse>,
        graceful_shutdown: CancellationToken,
    ) -> Result<(), SessionError>;

    async fn run_quic(
        &self,
        connection: QuicConnection,
        options: ConnectionOptions,
        fuse: Arc<ConnectedFuse>,
        graceful_shutdown: CancellationToken,
    ) -> Result<(), SessionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Another connection with the same index is already registered; the
    /// supervisor will pick a new address.
    #[error("already connected to this edge location with a different connection")]
    DupConnRegister,
    /// The edge rejected the registration. Not reported to error sinks;
    /// the server logs these on its side.
    #[error("registration rejected by the edge: {cause:#}")]
    ServerRegister {
        cause: anyhow::Error,
        permanent: bool,
    },
    #[error("control stream encountered a failure: {0:#}")]
    ControlStream(anyhow::Error),
    #[error("stream listener encountered a failure: {0:#}")]
    StreamListener(anyhow::Error),
    #[error("datagram manager encountered a failure: {0:#}")]
    DatagramManager(anyhow::Error),
    #[error(transparent)]
    Quic(#[from] quinn::ConnectionError),
    /// No retry under any backoff will help.
    #[error("unrecoverable error: {0:#}")]
    Unrecoverable(anyhow::Error),
    #[error("{0:#}")]
    Other(anyhow::Error),
}

/// A server- or operator-initiated instruction to tear down and
/// re-establish one connection after a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSignal {
    pub delay: Duration,
}
