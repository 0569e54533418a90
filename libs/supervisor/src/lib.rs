#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Keeps a set of highly-available tunnel connections to the edge alive.
//!
//! The [`Supervisor`] owns N connection indices and starts one serving
//! task per index. Each attempt acquires an edge address, dials (via
//! [`edge_dialer`] for http2, quinn for quic), runs the wire-protocol
//! session of a collaborator and classifies the outcome: rotate the edge
//! address, fall back to the other protocol, back off, or give up.
//! Recovery is layered in that order; a protocol that registered once is
//! never walked away from.

pub mod edge_addrs;
mod fuse;
pub mod ip_fallback;
mod observer;
pub mod protocol;
pub mod retry;
mod server;
pub mod session;
mod supervisor;
#[cfg(test)]
mod testutil;
mod tracker;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use edge_addrs::EdgeAddrs;
use protocol::ProtocolSelector;
use session::{DatagramVersion, TunnelSession};

pub use fuse::{ConnectedFuse, ConnectedSignal};
pub use observer::{LogObserver, Observer};
pub use server::{
    CurvePreference, EdgeDial, EdgeQuicDialError, EdgeTunnelServer, NetDialer, QuicConnection,
    ServeError,
};
pub use supervisor::Supervisor;
pub use tracker::ConnTracker;

/// Upper bound on TCP/SOCKS5/quic dials and on the TLS handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum delay between successive HA tunnel spawns once the first
/// connection registered, so registrations don't arrive as a thundering
/// herd.
pub(crate) const REGISTRATION_INTERVAL: Duration = Duration::from_secs(1);

/// Base period of the supervisor's shared respawn backoff.
pub(crate) const TUNNEL_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Post-quantum key agreement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PqMode {
    Disabled,
    Preferred,
    Strict,
}

/// Free-form key/value pair attached to every tunnel registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

/// TLS material for quic connections. The client config is assembled per
/// process from these parts because the offered key-exchange groups
/// depend on the post-quantum and FIPS modes.
pub struct QuicTlsSettings {
    pub roots: Arc<rustls::RootCertStore>,
    /// SNI hostname the edge certificate is issued for.
    pub server_name: String,
    pub alpn: Vec<Vec<u8>>,
    /// `None` picks defaults based on the post-quantum and FIPS modes.
    pub curve_preferences: Option<Vec<CurvePreference>>,
}

pub struct EdgeTls {
    pub http2: edge_dialer::TlsSettings,
    pub quic: QuicTlsSettings,
}

/// Routes ICMP between user networks and the edge. Runs as a background
/// task for the lifetime of the supervisor.
#[async_trait]
pub trait IcmpRouter: Send + Sync {
    async fn serve(&self, ctx: CancellationToken) -> anyhow::Result<()>;
}

/// Periodically re-resolves origin DNS records.
#[async_trait]
pub trait OriginDnsRefresher: Send + Sync {
    async fn start_refreshing(&self, ctx: CancellationToken);
}

/// Immutable for the lifetime of the process.
pub struct TunnelConfig {
    /// Number of parallel tunnel connections to maintain. Clamped to the
    /// number of available edge addresses.
    pub ha_connections: usize,
    /// Backoff budget of every connection index.
    pub retries: u32,
    /// Edge address rotations a connectivity error may consume before the
    /// connection should also consider a protocol fallback.
    pub max_edge_addr_retries: u8,
    /// Local source IP for dials towards the edge (and towards the SOCKS5
    /// proxy when one is configured).
    pub edge_bind_addr: Option<IpAddr>,
    /// `socks5://[user[:pass]@]host[:port]`; unset dials directly.
    pub edge_proxy_url: Option<Url>,
    /// True when the edge addresses were configured statically rather
    /// than discovered.
    pub static_edge: bool,
    pub tls: EdgeTls,
    pub pq_mode: PqMode,
    pub fips_enabled: bool,
    /// Datagram protocol version, snapshotted from the account's feature
    /// set at startup.
    pub datagram_version: DatagramVersion,
    pub tags: Vec<Tag>,
    /// How long in-flight tunnels may drain after a graceful shutdown.
    pub grace_period: Duration,
    pub rpc_timeout: Duration,
    pub write_stream_timeout: Duration,

    pub edge_addrs: Arc<dyn EdgeAddrs>,
    pub protocol_selector: Arc<dyn ProtocolSelector>,
    pub session: Arc<dyn TunnelSession>,
    pub observer: Arc<dyn Observer>,
    pub icmp_router: Option<Arc<dyn IcmpRouter>>,
    pub origin_dns: Option<Arc<dyn OriginDnsRefresher>>,
}
