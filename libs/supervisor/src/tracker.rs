//! Tracks which connection indices completed registration, and with
//! which protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Protocol;

#[derive(Clone, Default)]
pub struct ConnTracker {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    connected: HashMap<u8, Protocol>,
    /// Protocols any connection has ever registered with. Never cleared;
    /// a protocol that worked once is assumed to keep working.
    ever_connected_with: HashSet<Protocol>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self, index: u8, protocol: Protocol) {
        let mut state = self.inner.lock();

        state.connected.insert(index, protocol);
        state.ever_connected_with.insert(protocol);
    }

    pub fn mark_disconnected(&self, index: u8) {
        self.inner.lock().connected.remove(&index);
    }

    pub fn has_connected_with(&self, protocol: Protocol) -> bool {
        self.inner.lock().ever_connected_with.contains(&protocol)
    }

    pub fn protocol_for(&self, index: u8) -> Option<Protocol> {
        self.inner.lock().connected.get(&index).copied()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().connected.len()
    }
}
