//! Serves one tunnel connection: acquire an edge address, dial, run the
//! protocol session, classify the outcome and pace the next attempt.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use edge_dialer::{DialError, TlsSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::edge_addrs::{EdgeAddr, EdgeDiscoveryError};
use crate::fuse::{ConnectedFuse, ConnectedSignal};
use crate::ip_fallback::EdgeAddrHandler;
use crate::protocol::{Protocol, ProtocolFallback, select_next_protocol};
use crate::session::{ConnectionOptions, ReconnectSignal, SessionError};
use crate::tracker::ConnTracker;
use crate::{DIAL_TIMEOUT, PqMode, QuicTlsSettings, TunnelConfig};

const QUIC_MAX_IDLE_TIMEOUT_MS: u32 = 15_000;
const QUIC_KEEP_ALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Discovery(#[from] EdgeDiscoveryError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    QuicDial(#[from] EdgeQuicDialError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("restarting connection in {:?} due to reconnect signal", .0.delay)]
    Reconnect(ReconnectSignal),
    /// The surfaced cause of a server-side registration rejection.
    #[error("{0:#}")]
    Registration(anyhow::Error),
    #[error("connection attempt canceled")]
    Canceled,
    #[error("serve attempt panicked: {0}")]
    Panic(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to dial to the edge with quic: {cause:#}")]
pub struct EdgeQuicDialError {
    cause: anyhow::Error,
}

impl EdgeQuicDialError {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }

    pub fn connection_error(&self) -> Option<&quinn::ConnectionError> {
        self.cause.downcast_ref()
    }

    /// Whether the dial failed inside the cryptographic handshake.
    ///
    /// quinn does not expose transport error codes numerically, so this
    /// matches on the rendered crypto-range code instead.
    pub fn is_crypto(&self) -> bool {
        match self.connection_error() {
            Some(quinn::ConnectionError::TransportError(e)) => {
                e.code.to_string().contains("cryptographic handshake")
                    || e.reason.contains("handshake")
            }
            Some(_) | None => false,
        }
    }
}

/// An established quic connection plus the endpoint that drives it.
pub struct QuicConnection {
    pub connection: quinn::Connection,
    /// Kept alive for the lifetime of the session.
    _endpoint: Option<quinn::Endpoint>,
}

impl QuicConnection {
    pub(crate) fn new(connection: quinn::Connection, endpoint: quinn::Endpoint) -> Self {
        Self {
            connection,
            _endpoint: Some(endpoint),
        }
    }
}

/// Hybrid and classical key-exchange groups offered to the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurvePreference {
    X25519Mlkem768,
    X25519,
    P256,
    P384,
}

impl CurvePreference {
    fn kx_group(self) -> &'static dyn rustls::crypto::SupportedKxGroup {
        use rustls::crypto::aws_lc_rs::kx_group;

        match self {
            CurvePreference::X25519Mlkem768 => kx_group::X25519MLKEM768,
            CurvePreference::X25519 => kx_group::X25519,
            CurvePreference::P256 => kx_group::SECP256R1,
            CurvePreference::P384 => kx_group::SECP384R1,
        }
    }
}

pub(crate) fn curve_preferences(
    pq_mode: PqMode,
    fips_enabled: bool,
    configured: Option<&[CurvePreference]>,
) -> Vec<CurvePreference> {
    match pq_mode {
        // Strict means we offer nothing but hybrid post-quantum key
        // agreement.
        PqMode::Strict => vec![CurvePreference::X25519Mlkem768],
        PqMode::Preferred => {
            let mut prefs = configured
                .map(<[_]>::to_vec)
                .unwrap_or_else(|| default_curves(fips_enabled));
            if !prefs.contains(&CurvePreference::X25519Mlkem768) {
                prefs.insert(0, CurvePreference::X25519Mlkem768);
            }

            prefs
        }
        PqMode::Disabled => configured
            .map(<[_]>::to_vec)
            .unwrap_or_else(|| default_curves(fips_enabled)),
    }
}

fn default_curves(fips_enabled: bool) -> Vec<CurvePreference> {
    if fips_enabled {
        vec![CurvePreference::P256, CurvePreference::P384]
    } else {
        vec![
            CurvePreference::X25519,
            CurvePreference::P256,
            CurvePreference::P384,
        ]
    }
}

/// Initial UDP packet size that stays within a 1280-MTU overlay.
fn initial_packet_size(addr: SocketAddr) -> u16 {
    match addr {
        SocketAddr::V4(_) => 1232,
        SocketAddr::V6(_) => 1252,
    }
}

/// Connection establishment, injected so tests can script transports.
#[async_trait]
pub trait EdgeDial: Send + Sync {
    async fn dial_http2(
        &self,
        tls: &TlsSettings,
        edge_tcp_addr: SocketAddr,
        local_ip: Option<IpAddr>,
        proxy_url: Option<&Url>,
    ) -> Result<Box<dyn crate::session::EdgeStream>, DialError>;

    async fn dial_quic(
        &self,
        tls: &QuicTlsSettings,
        curves: &[CurvePreference],
        edge_udp_addr: SocketAddr,
        local_ip: Option<IpAddr>,
    ) -> Result<QuicConnection, EdgeQuicDialError>;
}

/// The production dialer: TCP + TLS through [`edge_dialer`], quic through
/// [`quinn`].
pub struct NetDialer;

#[async_trait]
impl EdgeDial for NetDialer {
    async fn dial_http2(
        &self,
        tls: &TlsSettings,
        edge_tcp_addr: SocketAddr,
        local_ip: Option<IpAddr>,
        proxy_url: Option<&Url>,
    ) -> Result<Box<dyn crate::session::EdgeStream>, DialError> {
        let stream =
            edge_dialer::dial_edge(DIAL_TIMEOUT, tls, edge_tcp_addr, local_ip, proxy_url).await?;

        Ok(Box::new(stream))
    }

    async fn dial_quic(
        &self,
        tls: &QuicTlsSettings,
        curves: &[CurvePreference],
        edge_udp_addr: SocketAddr,
        local_ip: Option<IpAddr>,
    ) -> Result<QuicConnection, EdgeQuicDialError> {
        let crypto = quic_client_config(tls, curves)?;
        let crypto =
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(EdgeQuicDialError::new)?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        let mut transport = quinn::TransportConfig::default();
        transport.initial_mtu(initial_packet_size(edge_udp_addr));
        transport.max_idle_timeout(Some(quinn::IdleTimeout::from(quinn::VarInt::from_u32(
            QUIC_MAX_IDLE_TIMEOUT_MS,
        ))));
        transport.keep_alive_interval(Some(QUIC_KEEP_ALIVE_INTERVAL));
        client_config.transport_config(Arc::new(transport));

        let bind_ip = local_ip.unwrap_or(match edge_udp_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let mut endpoint = quinn::Endpoint::client(SocketAddr::new(bind_ip, 0))
            .map_err(EdgeQuicDialError::new)?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint
            .connect(edge_udp_addr, &tls.server_name)
            .map_err(EdgeQuicDialError::new)?;

        let connection = match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(EdgeQuicDialError::new(e)),
            Err(_) => return Err(EdgeQuicDialError::new(quinn::ConnectionError::TimedOut)),
        };

        Ok(QuicConnection::new(connection, endpoint))
    }
}

fn quic_client_config(
    tls: &QuicTlsSettings,
    curves: &[CurvePreference],
) -> Result<rustls::ClientConfig, EdgeQuicDialError> {
    let provider = rustls::crypto::CryptoProvider {
        kx_groups: curves.iter().map(|c| c.kx_group()).collect(),
        ..rustls::crypto::aws_lc_rs::default_provider()
    };

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(EdgeQuicDialError::new)?
        .with_root_certificates(tls.roots.clone())
        .with_no_client_auth();
    config.alpn_protocols = tls.alpn.clone();

    Ok(config)
}

#[derive(Clone, Default)]
struct HaConnectionsGauge(Arc<AtomicUsize>);

impl HaConnectionsGauge {
    fn guard(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::SeqCst);

        GaugeGuard(Arc::clone(&self.0))
    }

    fn value(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves individual tunnel connections. One instance is shared by all
/// connection indices; all per-index state lives in the arguments.
pub struct EdgeTunnelServer {
    config: Arc<TunnelConfig>,
    dialer: Arc<dyn EdgeDial>,
    edge_addr_handler: EdgeAddrHandler,
    tracker: ConnTracker,
    reconnect_rx: flume::Receiver<ReconnectSignal>,
    graceful_shutdown: CancellationToken,
    gauge: HaConnectionsGauge,
}

impl EdgeTunnelServer {
    pub fn new(
        config: Arc<TunnelConfig>,
        reconnect_rx: flume::Receiver<ReconnectSignal>,
        graceful_shutdown: CancellationToken,
    ) -> Self {
        Self::with_dialer(config, Arc::new(NetDialer), reconnect_rx, graceful_shutdown)
    }

    pub fn with_dialer(
        config: Arc<TunnelConfig>,
        dialer: Arc<dyn EdgeDial>,
        reconnect_rx: flume::Receiver<ReconnectSignal>,
        graceful_shutdown: CancellationToken,
    ) -> Self {
        Self {
            edge_addr_handler: EdgeAddrHandler::new(config.max_edge_addr_retries),
            tracker: ConnTracker::new(),
            config,
            dialer,
            reconnect_rx,
            graceful_shutdown,
            gauge: HaConnectionsGauge::default(),
        }
    }

    pub fn tracker(&self) -> &ConnTracker {
        &self.tracker
    }

    /// Number of serve attempts currently in flight or running a session.
    pub fn active_connections(&self) -> usize {
        self.gauge.value()
    }

    /// One attempt to establish and run a tunnel connection, plus its
    /// scheduled wait. The supervisor re-invokes us after observing the
    /// returned error.
    pub async fn serve(
        &self,
        ctx: &CancellationToken,
        conn_index: u8,
        protocol_fallback: &mut ProtocolFallback,
        connected_signal: ConnectedSignal,
    ) -> Result<(), ServeError> {
        let _gauge = self.gauge.guard();

        let (fuse, fuse_rx) = ConnectedFuse::new();
        let waiter = {
            let tracker = self.tracker.clone();
            let observer = Arc::clone(&self.config.observer);
            let protocol = protocol_fallback.protocol();

            tokio::spawn(async move {
                if fuse_rx.await.unwrap_or(false) {
                    tracker.mark_connected(conn_index, protocol);
                    observer.send_connected(conn_index);
                    connected_signal.notify();
                }
            })
        };

        let addr = match self.config.edge_addrs.get_addr(conn_index) {
            Ok(addr) => addr,
            Err(e) => {
                fuse.fuse(false);
                return Err(e.into());
            }
        };

        tracing::debug!(
            conn_index,
            ip = %addr.udp.ip(),
            protocol = %protocol_fallback.protocol(),
            "Serving tunnel connection"
        );

        let (err, recoverable) = self
            .serve_tunnel(ctx, conn_index, addr, protocol_fallback, &fuse)
            .await;

        // Exactly one transition per attempt; a no-op if the session
        // already latched the fuse.
        fuse.fuse(false);
        let _ = waiter.await;

        if fuse.is_connected() {
            protocol_fallback.reset();
            self.tracker.mark_disconnected(conn_index);
        }

        self.config.observer.send_disconnect(conn_index);

        // An address- or dial-level failure warrants a different edge IP
        // for the next attempt.
        let (rotate, connectivity) = self
            .edge_addr_handler
            .should_get_new_address(conn_index, err.as_ref());
        let mut should_fallback_protocol = false;
        if rotate {
            if let Err(e) = self.config.edge_addrs.get_different_addr(conn_index, true) {
                return Err(e.into());
            }

            should_fallback_protocol = connectivity.is_some_and(|c| c.reached_max_retries());
        }

        // Out of backoff budget means no further attempt, recoverable or
        // not; the supervisor abandons the index once it sees the error.
        let (duration, retry) = protocol_fallback.max_backoff_duration();
        if !retry {
            return result_from(err);
        }

        if recoverable {
            self.config.observer.send_reconnect(conn_index);
            tracing::info!(conn_index, "Retrying connection in up to {duration:?}");
        }

        let timer = protocol_fallback.backoff_timer();

        tokio::select! {
            () = ctx.cancelled() => return Err(ServeError::Canceled),
            () = self.graceful_shutdown.cancelled() => return Ok(()),
            () = wait_or_pend(timer) => {
                // A protocol that registered once is assumed to work; no
                // reason to walk away from it.
                if !should_fallback_protocol
                    || self.tracker.has_connected_with(self.config.protocol_selector.current())
                {
                    return result_from(err);
                }

                if !select_next_protocol(
                    conn_index,
                    protocol_fallback,
                    &*self.config.protocol_selector,
                    err.as_ref(),
                ) {
                    return result_from(err);
                }
            }
        }

        result_from(err)
    }

    /// Runs one session and classifies its outcome into (error,
    /// recoverable).
    async fn serve_tunnel(
        &self,
        ctx: &CancellationToken,
        conn_index: u8,
        addr: EdgeAddr,
        protocol_fallback: &mut ProtocolFallback,
        fuse: &Arc<ConnectedFuse>,
    ) -> (Option<ServeError>, bool) {
        let result = self
            .serve_connection(ctx, conn_index, addr, protocol_fallback, fuse)
            .await;

        match result {
            Ok(()) => (None, false),
            Err(ServeError::Session(SessionError::ServerRegister { cause, permanent })) => {
                // Not forwarded to error sinks; the server logs these on
                // its side.
                tracing::error!(conn_index, "Register tunnel error from server side: {cause:#}");

                (Some(ServeError::Registration(cause)), !permanent)
            }
            Err(err @ ServeError::Session(SessionError::DupConnRegister)) => {
                tracing::warn!(conn_index, "Unable to establish connection: {err}");

                // Don't retry this address anymore, the supervisor will
                // pick a new one.
                (Some(err), false)
            }
            Err(err @ ServeError::QuicDial(_)) => (Some(err), false),
            Err(ServeError::Reconnect(signal)) => {
                tracing::info!(
                    conn_index,
                    "Restarting connection due to reconnect signal in {:?}",
                    signal.delay
                );
                tokio::time::sleep(signal.delay).await;

                (Some(ServeError::Reconnect(signal)), true)
            }
            Err(err @ ServeError::Canceled) => {
                tracing::debug!(conn_index, "Serve tunnel error: {err}");

                (Some(err), false)
            }
            Err(err @ ServeError::Session(SessionError::Unrecoverable(_))) => {
                tracing::error!(conn_index, "Serve tunnel error: {err}");

                (Some(err), false)
            }
            Err(err @ ServeError::Panic(_)) => {
                tracing::error!(conn_index, "Serve tunnel error: {err}");

                (Some(err), true)
            }
            Err(err) => {
                tracing::warn!(conn_index, "Serve tunnel error: {err}");

                (Some(err), true)
            }
        }
    }

    async fn serve_connection(
        &self,
        ctx: &CancellationToken,
        conn_index: u8,
        addr: EdgeAddr,
        protocol_fallback: &mut ProtocolFallback,
        fuse: &Arc<ConnectedFuse>,
    ) -> Result<(), ServeError> {
        let options = self.connection_options(conn_index, addr, protocol_fallback.retries());

        match protocol_fallback.protocol() {
            Protocol::Http2 => {
                if self.config.pq_mode == PqMode::Strict {
                    return Err(SessionError::Unrecoverable(anyhow::anyhow!(
                        "post-quantum strict mode is not supported over http2"
                    ))
                    .into());
                }

                let stream = self
                    .dialer
                    .dial_http2(
                        &self.config.tls.http2,
                        addr.tcp,
                        self.config.edge_bind_addr,
                        self.config.edge_proxy_url.as_ref(),
                    )
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            conn_index,
                            "Unable to establish connection with the edge: {e}"
                        );

                        e
                    })?;

                let session = {
                    let factory = Arc::clone(&self.config.session);
                    let fuse = Arc::clone(fuse);
                    let graceful = self.graceful_shutdown.clone();

                    tokio::spawn(
                        async move { factory.run_http2(stream, options, fuse, graceful).await },
                    )
                };

                self.run_session(ctx, session).await
            }
            Protocol::Quic => {
                let curves = curve_preferences(
                    self.config.pq_mode,
                    self.config.fips_enabled,
                    self.config.tls.quic.curve_preferences.as_deref(),
                );

                let connection = match self
                    .dialer
                    .dial_quic(
                        &self.config.tls.quic,
                        &curves,
                        addr.udp,
                        self.config.edge_bind_addr,
                    )
                    .await
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        if self.config.fips_enabled
                            && self.config.pq_mode == PqMode::Strict
                            && e.is_crypto()
                        {
                            sentry::capture_error(&e);
                        }

                        tracing::warn!(
                            conn_index,
                            "Unable to establish quic connection with the edge: {e}"
                        );

                        return Err(e.into());
                    }
                };

                let session = {
                    let factory = Arc::clone(&self.config.session);
                    let fuse = Arc::clone(fuse);
                    let graceful = self.graceful_shutdown.clone();

                    tokio::spawn(async move {
                        factory.run_quic(connection, options, fuse, graceful).await
                    })
                };

                self.run_session(ctx, session).await
            }
        }
    }

    /// Races the session against the reconnect listener and cancellation.
    async fn run_session(
        &self,
        ctx: &CancellationToken,
        mut session: JoinHandle<Result<(), SessionError>>,
    ) -> Result<(), ServeError> {
        let reconnect_rx = self.reconnect_rx.clone();

        tokio::select! {
            result = &mut session => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => match e.try_into_panic() {
                    Ok(payload) => Err(ServeError::Panic(panic_message(&payload))),
                    Err(_) => Err(ServeError::Canceled),
                },
            },
            signal = listen_reconnect(reconnect_rx) => {
                session.abort();
                Err(ServeError::Reconnect(signal))
            }
            () = ctx.cancelled() => {
                session.abort();
                Err(ServeError::Canceled)
            }
        }
    }

    fn connection_options(
        &self,
        conn_index: u8,
        edge_addr: EdgeAddr,
        previous_attempts: u32,
    ) -> ConnectionOptions {
        ConnectionOptions {
            conn_index,
            edge_addr,
            previous_attempts,
            datagram_version: self.config.datagram_version,
            tags: self.config.tags.clone(),
            rpc_timeout: self.config.rpc_timeout,
            write_stream_timeout: self.config.write_stream_timeout,
            grace_period: self.config.grace_period,
        }
    }
}

async fn listen_reconnect(rx: flume::Receiver<ReconnectSignal>) -> ReconnectSignal {
    match rx.recv_async().await {
        Ok(signal) => signal,
        // No sender anymore; reconnects can no longer happen.
        Err(flume::RecvError::Disconnected) => std::future::pending().await,
    }
}

async fn wait_or_pend(timer: Option<tokio::time::Sleep>) {
    match timer {
        Some(sleep) => sleep.await,
        // Out of retries; only cancellation or shutdown get us out.
        None => std::future::pending().await,
    }
}

fn result_from(err: Option<ServeError>) -> Result<(), ServeError> {
    match err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
