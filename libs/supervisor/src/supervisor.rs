//! The control loop that keeps N tunnel connections alive.
//!
//! One task serves each live connection index; everything else happens on
//! the supervisor task. Per-index state travels with the serving task and
//! comes back inside its result message, so no state is ever shared
//! between tasks.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::edge_addrs::EdgeDiscoveryError;
use crate::fuse::ConnectedSignal;
use crate::protocol::ProtocolFallback;
use crate::retry::{BackoffHandler, DEFAULT_BASE_TIME};
use crate::server::{EdgeTunnelServer, ServeError};
use crate::session::{ReconnectSignal, SessionError};
use crate::{REGISTRATION_INTERVAL, TUNNEL_RETRY_DURATION, TunnelConfig};

const FIRST_CONN_INDEX: u8 = 0;

/// Result of one serve attempt. Hands the per-index fallback state back
/// to the supervisor.
struct TunnelResult {
    index: u8,
    err: Option<ServeError>,
    fallback: ProtocolFallback,
}

enum InitError {
    EarlyShutdown,
    Serve(ServeError),
}

pub struct Supervisor {
    config: Arc<TunnelConfig>,
    server: Arc<EdgeTunnelServer>,
    graceful_shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: Arc<TunnelConfig>,
        reconnect_rx: flume::Receiver<ReconnectSignal>,
        graceful_shutdown: CancellationToken,
    ) -> Self {
        let server = Arc::new(EdgeTunnelServer::new(
            Arc::clone(&config),
            reconnect_rx,
            graceful_shutdown.clone(),
        ));

        Self::with_server(config, server, graceful_shutdown)
    }

    pub fn with_server(
        config: Arc<TunnelConfig>,
        server: Arc<EdgeTunnelServer>,
        graceful_shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            server,
            graceful_shutdown,
        }
    }

    pub fn server(&self) -> &Arc<EdgeTunnelServer> {
        &self.server
    }

    /// Runs until `ctx` is cancelled, the first tunnel fails to
    /// initialize, or a graceful shutdown drained every connection.
    ///
    /// `connected_signal` is notified once the first connection has
    /// registered with the edge.
    pub async fn run(
        self,
        ctx: CancellationToken,
        connected_signal: ConnectedSignal,
    ) -> Result<(), ServeError> {
        if let Some(icmp_router) = self.config.icmp_router.clone() {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = icmp_router.serve(ctx).await {
                    tracing::error!("ICMP router terminated: {e:#}");
                }
            });
        }

        if let Some(origin_dns) = self.config.origin_dns.clone() {
            let ctx = ctx.clone();
            tokio::spawn(async move { origin_dns.start_refreshing(ctx).await });
        }

        let (results_tx, mut results_rx) = mpsc::channel::<TunnelResult>(1);

        let mut ha_connections = self.config.ha_connections;
        let mut fallbacks: HashMap<u8, ProtocolFallback> = HashMap::new();
        let mut connecting: HashMap<u8, ConnectedSignal> = HashMap::new();
        let mut next_connected: Option<(u8, ConnectedSignal)> = None;

        match self
            .initialize(
                &ctx,
                &results_tx,
                &mut results_rx,
                &connected_signal,
                &mut ha_connections,
                &mut fallbacks,
                &mut connecting,
                &mut next_connected,
            )
            .await
        {
            Ok(()) => {}
            Err(InitError::EarlyShutdown) => return Ok(()),
            Err(InitError::Serve(e)) => return Err(e),
        }

        let mut tunnels_waiting: Vec<u8> = Vec::new();
        let mut tunnels_active = ha_connections;
        let mut backoff =
            BackoffHandler::new(self.config.retries, TUNNEL_RETRY_DURATION, true);
        let mut backoff_timer: Option<Pin<Box<Sleep>>> = None;
        let mut shutting_down = false;

        loop {
            tokio::select! {
                () = ctx.cancelled() => {
                    // Every spawned attempt reports exactly once; drain
                    // them before returning.
                    while tunnels_active > 0 {
                        if results_rx.recv().await.is_none() {
                            break;
                        }
                        tunnels_active -= 1;
                    }

                    return Ok(());
                }
                Some(result) = results_rx.recv() => {
                    let TunnelResult { index, err, fallback } = result;
                    fallbacks.insert(index, fallback);
                    tunnels_active = tunnels_active.saturating_sub(1);

                    match err {
                        Some(err) if !shutting_down => {
                            // Tunnels closed by a reconnect signal already
                            // slept their delay; respawn right away.
                            if matches!(err, ServeError::Reconnect(_)) {
                                if let Some(fallback) = fallbacks.remove(&index) {
                                    let signal = new_connected_tunnel_signal(
                                        index,
                                        &mut connecting,
                                        &mut next_connected,
                                    );
                                    self.spawn_tunnel(&ctx, &results_tx, index, fallback, signal);
                                    tunnels_active += 1;
                                }
                                continue;
                            }

                            // Make sure we don't continue if there is no
                            // more backoff left for this index.
                            let retry = fallbacks
                                .get(&index)
                                .is_some_and(|f| f.max_backoff_duration().1);
                            if !retry {
                                tracing::warn!(conn_index = index, "Connection abandoned: {err}");
                                // Drop the stale connecting entry so the
                                // grace-period bookkeeping only tracks
                                // indices that can still connect.
                                wait_for_next_tunnel(index, &mut connecting, &mut next_connected);
                                continue;
                            }

                            tracing::info!(conn_index = index, "Tunnel disconnected: {err}");

                            tunnels_waiting.push(index);
                            wait_for_next_tunnel(index, &mut connecting, &mut next_connected);

                            if backoff_timer.is_none() {
                                if let Some(timer) = backoff.backoff_timer() {
                                    backoff_timer = Some(Box::pin(timer));
                                }
                            }
                        }
                        Some(_) | None => {
                            if tunnels_active == 0 {
                                // All connections wound down on their own;
                                // nothing left to supervise.
                                return Ok(());
                            }
                        }
                    }
                }
                () = wait_sleep(&mut backoff_timer), if backoff_timer.is_some() => {
                    backoff_timer = None;

                    for index in std::mem::take(&mut tunnels_waiting) {
                        if let Some(fallback) = fallbacks.remove(&index) {
                            tracing::debug!(conn_index = index, "Respawning tunnel connection");
                            let signal = new_connected_tunnel_signal(
                                index,
                                &mut connecting,
                                &mut next_connected,
                            );
                            self.spawn_tunnel(&ctx, &results_tx, index, fallback, signal);
                            tunnels_active += 1;
                        }
                    }
                }
                () = wait_signal(&next_connected), if next_connected.is_some() => {
                    if let Some((index, _)) = next_connected.clone() {
                        let more = wait_for_next_tunnel(index, &mut connecting, &mut next_connected);
                        if !more && tunnels_waiting.is_empty() {
                            // Everything is connected; the next isolated
                            // failure should retry quickly.
                            backoff.set_grace_period();
                        }
                    }
                }
                () = self.graceful_shutdown.cancelled(), if !shutting_down => {
                    tracing::info!("Graceful shutdown signalled; draining tunnel connections");
                    // Actively-running tunnels observe the same signal
                    // and wind down by themselves.
                    shutting_down = true;
                }
            }
        }
    }

    async fn initialize(
        &self,
        ctx: &CancellationToken,
        results_tx: &mpsc::Sender<TunnelResult>,
        results_rx: &mut mpsc::Receiver<TunnelResult>,
        connected_signal: &ConnectedSignal,
        ha_connections: &mut usize,
        fallbacks: &mut HashMap<u8, ProtocolFallback>,
        connecting: &mut HashMap<u8, ConnectedSignal>,
        next_connected: &mut Option<(u8, ConnectedSignal)>,
    ) -> Result<(), InitError> {
        let available = self.config.edge_addrs.available_addrs();
        if *ha_connections > available {
            tracing::info!(
                "You requested {} HA connections but only {available} edge addresses are available",
                *ha_connections
            );
            *ha_connections = available;
        }

        let first_fallback = ProtocolFallback::new(
            self.new_backoff(),
            self.config.protocol_selector.current(),
        );
        self.start_first_tunnel(ctx, results_tx, first_fallback, connected_signal.clone());

        tokio::select! {
            () = ctx.cancelled() => {
                let _ = results_rx.recv().await;
                return Err(InitError::Serve(ServeError::Canceled));
            }
            Some(result) = results_rx.recv() => {
                fallbacks.insert(result.index, result.fallback);
                if let Some(err) = result.err {
                    return Err(InitError::Serve(err));
                }
                // The first tunnel exited cleanly before registering;
                // keep going and let the loop sort it out.
            }
            () = self.graceful_shutdown.cancelled() => return Err(InitError::EarlyShutdown),
            () = connected_signal.wait() => {}
        }

        // At least one successful connection, so start the rest. The
        // first tunnel has registered with the edge, so its siblings
        // start with the protocol it settled on instead of renegotiating
        // a known failure.
        let settled = self
            .server
            .tracker()
            .protocol_for(FIRST_CONN_INDEX)
            .unwrap_or_else(|| self.config.protocol_selector.current());

        for i in 1..*ha_connections {
            let index = i as u8;
            let fallback = ProtocolFallback::new(self.new_backoff(), settled);
            let signal = new_connected_tunnel_signal(index, connecting, next_connected);
            self.spawn_tunnel(ctx, results_tx, index, fallback, signal);

            tokio::time::sleep(REGISTRATION_INTERVAL).await;
        }

        Ok(())
    }

    fn spawn_tunnel(
        &self,
        ctx: &CancellationToken,
        results_tx: &mpsc::Sender<TunnelResult>,
        index: u8,
        mut fallback: ProtocolFallback,
        signal: ConnectedSignal,
    ) {
        let server = Arc::clone(&self.server);
        let ctx = ctx.clone();
        let results_tx = results_tx.clone();

        tokio::spawn(async move {
            let err = server.serve(&ctx, index, &mut fallback, signal).await.err();

            let _ = results_tx
                .send(TunnelResult {
                    index,
                    err,
                    fallback,
                })
                .await;
        });
    }

    /// The first tunnel retries a restricted error class in place: the
    /// failures we expect to be transient while a freshly created tunnel
    /// propagates through the edge.
    fn start_first_tunnel(
        &self,
        ctx: &CancellationToken,
        results_tx: &mpsc::Sender<TunnelResult>,
        mut fallback: ProtocolFallback,
        signal: ConnectedSignal,
    ) {
        let server = Arc::clone(&self.server);
        let static_edge = self.config.static_edge;
        let ctx = ctx.clone();
        let results_tx = results_tx.clone();

        tokio::spawn(async move {
            let err = loop {
                match server
                    .serve(&ctx, FIRST_CONN_INDEX, &mut fallback, signal.clone())
                    .await
                {
                    Ok(()) => break None,
                    Err(err) => {
                        if ctx.is_cancelled() {
                            break Some(err);
                        }

                        // Make sure we don't continue if there is no more
                        // backoff left.
                        let (_, retry) = fallback.max_backoff_duration();
                        if !retry {
                            break Some(err);
                        }

                        if !retry_inline(&err, static_edge) {
                            break Some(err);
                        }

                        tracing::info!("Retrying first tunnel connection: {err}");
                    }
                }
            };

            let _ = results_tx
                .send(TunnelResult {
                    index: FIRST_CONN_INDEX,
                    err,
                    fallback,
                })
                .await;
        });
    }

    fn new_backoff(&self) -> BackoffHandler {
        BackoffHandler::new(self.config.retries, DEFAULT_BASE_TIME, false)
    }
}

fn retry_inline(err: &ServeError, static_edge: bool) -> bool {
    // The edge can take a few seconds to learn about a new tunnel.
    if err.to_string().contains("Unauthorized") {
        return true;
    }

    match err {
        // With statically provided addresses we keep trying them
        // regardless of availability.
        ServeError::Discovery(EdgeDiscoveryError::NoAddressesLeft) => static_edge,
        ServeError::Session(SessionError::DupConnRegister) => true,
        ServeError::Session(SessionError::Quic(
            quinn::ConnectionError::TimedOut | quinn::ConnectionError::ApplicationClosed(_),
        )) => true,
        ServeError::Session(SessionError::ControlStream(_))
        | ServeError::Session(SessionError::StreamListener(_))
        | ServeError::Session(SessionError::DatagramManager(_)) => true,
        ServeError::Dial(_) | ServeError::QuicDial(_) => true,
        ServeError::Session(_)
        | ServeError::Reconnect(_)
        | ServeError::Registration(_)
        | ServeError::Canceled
        | ServeError::Panic(_) => false,
    }
}

/// Installs a fresh per-attempt connected signal for `index` and makes it
/// the one the supervisor waits on next.
fn new_connected_tunnel_signal(
    index: u8,
    connecting: &mut HashMap<u8, ConnectedSignal>,
    next_connected: &mut Option<(u8, ConnectedSignal)>,
) -> ConnectedSignal {
    let signal = ConnectedSignal::new();
    connecting.insert(index, signal.clone());
    *next_connected = Some((index, signal.clone()));

    signal
}

/// Removes `index` from the connecting set and picks any remaining entry
/// to await next. Returns true iff another pending index exists.
fn wait_for_next_tunnel(
    index: u8,
    connecting: &mut HashMap<u8, ConnectedSignal>,
    next_connected: &mut Option<(u8, ConnectedSignal)>,
) -> bool {
    connecting.remove(&index);
    *next_connected = None;

    if let Some((&next_index, signal)) = connecting.iter().next() {
        *next_connected = Some((next_index, signal.clone()));

        return true;
    }

    false
}

async fn wait_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn wait_signal(next_connected: &Option<(u8, ConnectedSignal)>) {
    match next_connected {
        Some((_, signal)) => signal.wait().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::edge_addrs::StaticEdgeAddrs;
    use crate::testutil::{
        Behavior, RecordingObserver, ScriptedDialer, ScriptedSession, test_addrs, test_config,
    };

    struct Harness {
        supervisor: Supervisor,
        session: Arc<ScriptedSession>,
        dialer: Arc<ScriptedDialer>,
        observer: Arc<RecordingObserver>,
        reconnect_tx: flume::Sender<ReconnectSignal>,
        graceful: CancellationToken,
        ctx: CancellationToken,
    }

    fn harness(configure: impl FnOnce(&mut TunnelConfig)) -> Harness {
        let session = Arc::new(ScriptedSession::default());
        let dialer = Arc::new(ScriptedDialer::default());
        let observer = Arc::new(RecordingObserver::default());

        let mut config = test_config(session.clone(), observer.clone());
        configure(&mut config);
        let config = Arc::new(config);

        let (reconnect_tx, reconnect_rx) = flume::unbounded();
        let graceful = CancellationToken::new();
        let server = Arc::new(EdgeTunnelServer::with_dialer(
            Arc::clone(&config),
            dialer.clone(),
            reconnect_rx,
            graceful.clone(),
        ));

        Harness {
            supervisor: Supervisor::with_server(config, server, graceful.clone()),
            session,
            dialer,
            observer,
            reconnect_tx,
            graceful,
            ctx: CancellationToken::new(),
        }
    }

    /// Polls `condition` while the paused clock advances.
    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_staggers_all_connections() {
        let h = harness(|_| {});
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        signal.wait().await;

        let observer = h.observer.clone();
        wait_until(move || observer.connected_total() == 4).await;

        assert_eq!(h.observer.connected_order(), vec![0, 1, 2, 3]);
        // Nothing failed, so the respawn backoff never activated.
        assert_eq!(h.observer.reconnected_total(), 0);

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clamps_ha_connections_to_available_addresses() {
        let h = harness(|config| {
            config.edge_addrs = Arc::new(StaticEdgeAddrs::new(test_addrs(2)));
        });
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        let observer = h.observer.clone();
        wait_until(move || observer.connected_total() == 2).await;

        assert_eq!(h.observer.connected_order(), vec![0, 1]);

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_registration_failure_aborts_initialization() {
        let h = harness(|_| {});
        h.session.script(
            0,
            [Behavior::fail(|| SessionError::ServerRegister {
                cause: anyhow::anyhow!("tunnel deleted"),
                permanent: true,
            })],
        );

        let err = h
            .supervisor
            .run(h.ctx.clone(), ConnectedSignal::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("tunnel deleted"));
        // No sibling tunnels were ever spawned.
        assert_eq!(h.observer.connected_total(), 0);
        assert_eq!(h.dialer.http2_dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tunnel_retries_unauthorized_inline() {
        let h = harness(|_| {});
        h.session.script(
            0,
            [
                Behavior::fail(|| SessionError::ServerRegister {
                    cause: anyhow::anyhow!("Unauthorized: tunnel not found"),
                    permanent: false,
                }),
                Behavior::fail(|| SessionError::ServerRegister {
                    cause: anyhow::anyhow!("Unauthorized: tunnel not found"),
                    permanent: false,
                }),
            ],
        );
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        signal.wait().await;

        // Two rejected attempts before the one that registered.
        assert!(h.dialer.http2_dials() >= 3);

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_signal_respawns_immediately() {
        let h = harness(|config| {
            config.ha_connections = 1;
        });
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        signal.wait().await;

        h.reconnect_tx
            .send(ReconnectSignal {
                delay: Duration::from_secs(2),
            })
            .unwrap();

        let observer = h.observer.clone();
        wait_until(move || observer.connected(0) == 2).await;

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_index_does_not_block_later_reconnects() {
        let h = harness(|config| {
            config.ha_connections = 2;
            config.retries = 1;
        });
        h.session.script(
            1,
            [Behavior::fail(|| SessionError::Other(anyhow::anyhow!("edge hiccup")))],
        );
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        signal.wait().await;

        // Index 1 exhausts its backoff budget on the first failure and is
        // abandoned, clearing its pending connected-signal entry.
        let observer = h.observer.clone();
        wait_until(move || observer.disconnected(1) >= 1).await;

        h.reconnect_tx
            .send(ReconnectSignal {
                delay: Duration::from_millis(10),
            })
            .unwrap();

        let observer = h.observer.clone();
        wait_until(move || observer.connected(0) == 2).await;

        // The abandoned index was never respawned.
        assert_eq!(h.observer.connected(1), 0);

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_drains_to_completion() {
        let h = harness(|config| {
            config.ha_connections = 3;
        });
        h.session.script(
            1,
            [Behavior::fail(|| SessionError::Other(anyhow::anyhow!("edge hiccup")))],
        );
        h.session.script(
            2,
            [Behavior::fail(|| SessionError::Other(anyhow::anyhow!("edge hiccup")))],
        );
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        signal.wait().await;

        // Both siblings failed and entered the waiting list.
        let observer = h.observer.clone();
        wait_until(move || observer.disconnected(1) >= 1 && observer.disconnected(2) >= 1).await;

        h.graceful.cancel();

        // The loop drains once every connection has wound down.
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sibling_is_respawned_after_backoff() {
        let h = harness(|config| {
            config.ha_connections = 2;
        });
        h.session.script(
            1,
            [Behavior::fail(|| SessionError::Other(anyhow::anyhow!("edge hiccup")))],
        );
        let signal = ConnectedSignal::new();

        let run = tokio::spawn(h.supervisor.run(h.ctx.clone(), signal.clone()));

        let observer = h.observer.clone();
        wait_until(move || observer.connected(1) >= 1).await;

        h.ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn wait_for_next_tunnel_on_missing_index_is_a_no_op() {
        let mut connecting = HashMap::new();
        let mut next_connected = None;

        assert!(!wait_for_next_tunnel(3, &mut connecting, &mut next_connected));

        new_connected_tunnel_signal(1, &mut connecting, &mut next_connected);

        assert!(wait_for_next_tunnel(3, &mut connecting, &mut next_connected));
        assert!(matches!(next_connected, Some((1, _))));
    }
}
