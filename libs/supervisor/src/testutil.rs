//! Scripted collaborators for the serve and supervisor tests.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use edge_dialer::{DialError, TlsSettings};
use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::edge_addrs::{EdgeAddr, StaticEdgeAddrs};
use crate::fuse::ConnectedFuse;
use crate::observer::Observer;
use crate::protocol::{Protocol, StaticSelector};
use crate::server::{CurvePreference, EdgeDial, EdgeQuicDialError, QuicConnection};
use crate::session::{
    ConnectionOptions, DatagramVersion, EdgeStream, SessionError, TunnelSession,
};
use crate::{EdgeTls, PqMode, QuicTlsSettings, TunnelConfig};

pub(crate) enum Behavior {
    /// Latch the fuse, then run until graceful shutdown.
    ConnectThenRun,
    /// Latch the fuse and finish cleanly right away.
    ConnectThenOk,
    Fail(Box<dyn FnOnce() -> SessionError + Send>),
    Panic,
}

impl Behavior {
    pub(crate) fn fail(make: impl FnOnce() -> SessionError + Send + 'static) -> Self {
        Self::Fail(Box::new(make))
    }
}

/// Session factory that plays back a per-index script and falls back to
/// [`Behavior::ConnectThenRun`] once the script is exhausted.
#[derive(Default)]
pub(crate) struct ScriptedSession {
    scripts: Mutex<HashMap<u8, VecDeque<Behavior>>>,
}

impl ScriptedSession {
    pub(crate) fn script(&self, index: u8, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .entry(index)
            .or_default()
            .extend(behaviors);
    }

    async fn run(
        &self,
        options: ConnectionOptions,
        fuse: Arc<ConnectedFuse>,
        graceful_shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        let behavior = self
            .scripts
            .lock()
            .get_mut(&options.conn_index)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::ConnectThenRun);

        match behavior {
            Behavior::ConnectThenRun => {
                fuse.connected();
                graceful_shutdown.cancelled().await;

                Ok(())
            }
            Behavior::ConnectThenOk => {
                fuse.connected();

                Ok(())
            }
            Behavior::Fail(make) => Err(make()),
            Behavior::Panic => panic!("session blew up"),
        }
    }
}

#[async_trait]
impl TunnelSession for ScriptedSession {
    async fn run_http2(
        &self,
        _stream: Box<dyn EdgeStream>,
        options: ConnectionOptions,
        fuse: Arc<ConnectedFuse>,
        graceful_shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        self.run(options, fuse, graceful_shutdown).await
    }

    async fn run_quic(
        &self,
        _connection: QuicConnection,
        options: ConnectionOptions,
        fuse: Arc<ConnectedFuse>,
        graceful_shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        self.run(options, fuse, graceful_shutdown).await
    }
}

/// Dialer that hands out in-memory streams for http2 and fails every
/// quic dial with an idle timeout.
#[derive(Default)]
pub(crate) struct ScriptedDialer {
    http2_dials: AtomicUsize,
    quic_dials: AtomicUsize,
}

impl ScriptedDialer {
    pub(crate) fn http2_dials(&self) -> usize {
        self.http2_dials.load(Ordering::SeqCst)
    }

    pub(crate) fn quic_dials(&self) -> usize {
        self.quic_dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EdgeDial for ScriptedDialer {
    async fn dial_http2(
        &self,
        _tls: &TlsSettings,
        _edge_tcp_addr: SocketAddr,
        _local_ip: Option<IpAddr>,
        _proxy_url: Option<&Url>,
    ) -> Result<Box<dyn EdgeStream>, DialError> {
        self.http2_dials.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(1024);
        // The sessions under test never read; parking the server half in a
        // task keeps the pipe open without further bookkeeping.
        tokio::spawn(async move {
            let _server = server;
            std::future::pending::<()>().await;
        });

        Ok(Box::new(client))
    }

    async fn dial_quic(
        &self,
        _tls: &QuicTlsSettings,
        _curves: &[CurvePreference],
        _edge_udp_addr: SocketAddr,
        _local_ip: Option<IpAddr>,
    ) -> Result<QuicConnection, EdgeQuicDialError> {
        self.quic_dials.fetch_add(1, Ordering::SeqCst);

        Err(EdgeQuicDialError::new(quinn::ConnectionError::TimedOut))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverEvent {
    Connected(u8),
    Reconnect(u8),
    Disconnect(u8),
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub(crate) fn connected(&self, index: u8) -> usize {
        self.count(ObserverEvent::Connected(index))
    }

    pub(crate) fn reconnected(&self, index: u8) -> usize {
        self.count(ObserverEvent::Reconnect(index))
    }

    pub(crate) fn disconnected(&self, index: u8) -> usize {
        self.count(ObserverEvent::Disconnect(index))
    }

    pub(crate) fn connected_total(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Connected(_)))
            .count()
    }

    pub(crate) fn reconnected_total(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Reconnect(_)))
            .count()
    }

    pub(crate) fn connected_order(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Connected(index) => Some(*index),
                ObserverEvent::Reconnect(_) | ObserverEvent::Disconnect(_) => None,
            })
            .collect()
    }

    fn count(&self, event: ObserverEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

impl Observer for RecordingObserver {
    fn send_connected(&self, conn_index: u8) {
        self.events.lock().push(ObserverEvent::Connected(conn_index));
    }

    fn send_reconnect(&self, conn_index: u8) {
        self.events.lock().push(ObserverEvent::Reconnect(conn_index));
    }

    fn send_disconnect(&self, conn_index: u8) {
        self.events.lock().push(ObserverEvent::Disconnect(conn_index));
    }
}

pub(crate) fn test_addrs(n: u16) -> Vec<EdgeAddr> {
    (0..n)
        .map(|i| {
            let socket: SocketAddr = format!("198.51.100.{}:7844", i + 1).parse().unwrap();

            EdgeAddr::new(socket, socket)
        })
        .collect()
}

pub(crate) fn test_config(
    session: Arc<ScriptedSession>,
    observer: Arc<RecordingObserver>,
) -> TunnelConfig {
    let roots = Arc::new(rustls::RootCertStore::empty());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(Arc::clone(&roots))
        .with_no_client_auth();

    TunnelConfig {
        ha_connections: 4,
        retries: 5,
        max_edge_addr_retries: 3,
        edge_bind_addr: None,
        edge_proxy_url: None,
        static_edge: true,
        tls: EdgeTls {
            http2: TlsSettings {
                config: Arc::new(tls_config),
                server_name: ServerName::try_from("edge.test".to_owned()).unwrap(),
            },
            quic: QuicTlsSettings {
                roots,
                server_name: "edge.test".to_owned(),
                alpn: vec![b"edge-tunnel".to_vec()],
                curve_preferences: None,
            },
        },
        pq_mode: PqMode::Disabled,
        fips_enabled: false,
        datagram_version: DatagramVersion::V3,
        tags: Vec::new(),
        grace_period: Duration::from_secs(30),
        rpc_timeout: Duration::from_secs(5),
        write_stream_timeout: Duration::from_secs(5),
        edge_addrs: Arc::new(StaticEdgeAddrs::new(test_addrs(10))),
        protocol_selector: Arc::new(StaticSelector {
            current: Protocol::Http2,
            fallback: None,
        }),
        session,
        observer,
        icmp_router: None,
        origin_dns: None,
    }
}
