//! One-shot signalling between a tunnel connection and the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A one-shot boolean latch with a single waiter.
///
/// Exactly one of `fuse(true)` / `fuse(false)` wins per serve attempt;
/// later calls are no-ops.
pub struct ConnectedFuse {
    tx: Mutex<Option<oneshot::Sender<bool>>>,
    connected: AtomicBool,
}

impl ConnectedFuse {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();

        let fuse = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            connected: AtomicBool::new(false),
        });

        (fuse, rx)
    }

    /// Latches the fuse as connected. Called by the session once the
    /// control stream completed registration with the edge.
    pub fn connected(&self) {
        self.fuse(true);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn fuse(&self, connected: bool) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };

        if connected {
            self.connected.store(true, Ordering::Release);
        }

        let _ = tx.send(connected);
    }
}

/// Notify-once, await-many signal that a tunnel finished registration.
///
/// Clones share the underlying state, so the supervisor and the caller of
/// [`Supervisor::run`] can both wait on the same signal.
///
/// [`Supervisor::run`]: crate::Supervisor::run
#[derive(Clone, Default)]
pub struct ConnectedSignal {
    token: CancellationToken,
}

impl ConnectedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.token.cancel();
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    pub fn is_notified(&self) -> bool {
        self.token.is_cancelled()
    }
}
