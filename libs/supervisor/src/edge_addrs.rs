//! The edge address store consumed by the supervisor.
//!
//! Discovery of addresses (DNS over a region, IP version policy) is a
//! collaborator concern; this module defines the seam plus the static
//! store used when the operator configures edge addresses explicitly.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

/// One edge point-of-presence: the same host reachable over two
/// transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeAddr {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
}

impl EdgeAddr {
    pub fn new(tcp: SocketAddr, udp: SocketAddr) -> Self {
        Self { tcp, udp }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EdgeDiscoveryError {
    #[error("there are no edge addresses left to resolve to")]
    NoAddressesLeft,
}

/// Thread-safe store handing out one edge address per connection index.
pub trait EdgeAddrs: Send + Sync {
    /// The address assigned to `index`; stable until rotated.
    fn get_addr(&self, index: u8) -> Result<EdgeAddr, EdgeDiscoveryError>;

    /// Rotates `index` to a new address. With `force`, the current
    /// address is never handed back.
    fn get_different_addr(&self, index: u8, force: bool) -> Result<EdgeAddr, EdgeDiscoveryError>;

    fn available_addrs(&self) -> usize;
}

/// Statically configured edge addresses, assigned round-robin per
/// connection index.
pub struct StaticEdgeAddrs {
    inner: Mutex<Store>,
}

struct Store {
    addrs: Vec<EdgeAddr>,
    assignments: HashMap<u8, usize>,
    cursor: usize,
}

impl StaticEdgeAddrs {
    pub fn new(addrs: Vec<EdgeAddr>) -> Self {
        Self {
            inner: Mutex::new(Store {
                addrs,
                assignments: HashMap::new(),
                cursor: 0,
            }),
        }
    }
}

impl EdgeAddrs for StaticEdgeAddrs {
    fn get_addr(&self, index: u8) -> Result<EdgeAddr, EdgeDiscoveryError> {
        let mut store = self.inner.lock();

        if store.addrs.is_empty() {
            return Err(EdgeDiscoveryError::NoAddressesLeft);
        }

        if let Some(&position) = store.assignments.get(&index) {
            return Ok(store.addrs[position]);
        }

        let position = store.cursor % store.addrs.len();
        store.cursor += 1;
        store.assignments.insert(index, position);

        Ok(store.addrs[position])
    }

    fn get_different_addr(&self, index: u8, force: bool) -> Result<EdgeAddr, EdgeDiscoveryError> {
        let mut store = self.inner.lock();

        if store.addrs.is_empty() || (force && store.addrs.len() == 1) {
            return Err(EdgeDiscoveryError::NoAddressesLeft);
        }

        let current = store.assignments.get(&index).copied();
        let mut position = store.cursor % store.addrs.len();
        store.cursor += 1;

        if Some(position) == current {
            position = (position + 1) % store.addrs.len();
            store.cursor += 1;
        }

        store.assignments.insert(index, position);

        Ok(store.addrs[position])
    }

    fn available_addrs(&self) -> usize {
        self.inner.lock().addrs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: u16) -> Vec<EdgeAddr> {
        (0..n)
            .map(|i| {
                let socket: SocketAddr = format!("198.51.100.{}:7844", i + 1).parse().unwrap();
                EdgeAddr::new(socket, socket)
            })
            .collect()
    }

    #[test]
    fn assigns_stable_addresses_per_index() {
        let store = StaticEdgeAddrs::new(addrs(4));

        let first = store.get_addr(0).unwrap();
        let second = store.get_addr(1).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.get_addr(0).unwrap(), first);
        assert_eq!(store.get_addr(1).unwrap(), second);
    }

    #[test]
    fn forced_rotation_never_returns_the_current_address() {
        let store = StaticEdgeAddrs::new(addrs(2));
        let mut current = store.get_addr(0).unwrap();

        for _ in 0..4 {
            let rotated = store.get_different_addr(0, true).unwrap();

            assert_ne!(rotated, current);
            assert_eq!(store.get_addr(0).unwrap(), rotated);

            current = rotated;
        }
    }

    #[test]
    fn forced_rotation_with_a_single_address_is_exhausted() {
        let store = StaticEdgeAddrs::new(addrs(1));
        store.get_addr(0).unwrap();

        assert_eq!(
            store.get_different_addr(0, true),
            Err(EdgeDiscoveryError::NoAddressesLeft)
        );
    }

    #[test]
    fn empty_store_has_no_addresses() {
        let store = StaticEdgeAddrs::new(Vec::new());

        assert_eq!(store.available_addrs(), 0);
        assert_eq!(store.get_addr(0), Err(EdgeDiscoveryError::NoAddressesLeft));
    }

    #[test]
    fn reports_available_addresses() {
        assert_eq!(StaticEdgeAddrs::new(addrs(7)).available_addrs(), 7);
    }
}
