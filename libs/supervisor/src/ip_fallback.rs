//! Decides when a failed connection should rotate to a new edge address.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::server::ServeError;
use crate::session::SessionError;

/// A dial-layer failure that counts against the per-index rotation
/// budget. Once the budget is exhausted, the connection should also
/// consider a protocol fallback on its next attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityError {
    reached_max: bool,
}

impl ConnectivityError {
    pub fn reached_max_retries(&self) -> bool {
        self.reached_max
    }
}

pub struct EdgeAddrHandler {
    max_retries: u8,
    retries_by_conn_index: Mutex<HashMap<u8, u8>>,
}

impl EdgeAddrHandler {
    pub fn new(max_retries: u8) -> Self {
        Self {
            max_retries,
            retries_by_conn_index: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the error warrants a new edge address for `conn_index`,
    /// and whether it was a connectivity error.
    pub fn should_get_new_address(
        &self,
        conn_index: u8,
        err: Option<&ServeError>,
    ) -> (bool, Option<ConnectivityError>) {
        let Some(err) = err else {
            return (false, None);
        };

        match err {
            // A duplicate registration or an idle session means this edge
            // no longer wants us; move on without counting.
            ServeError::Session(SessionError::DupConnRegister)
            | ServeError::Session(SessionError::Quic(quinn::ConnectionError::TimedOut)) => {
                (true, None)
            }
            ServeError::Dial(_) | ServeError::QuicDial(_) => {
                let mut retries = self.retries_by_conn_index.lock();

                let count = retries.entry(conn_index).or_insert(0);
                *count += 1;
                let reached_max = *count >= self.max_retries;
                if reached_max {
                    *count = 0;
                }

                (true, Some(ConnectivityError { reached_max }))
            }
            ServeError::Session(_)
            | ServeError::Discovery(_)
            | ServeError::Reconnect(_)
            | ServeError::Registration(_)
            | ServeError::Canceled
            | ServeError::Panic(_) => (false, None),
        }
    }
}
