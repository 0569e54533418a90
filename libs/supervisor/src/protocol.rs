//! Wire-protocol selection and the per-connection fallback state machine.

use std::fmt;
use std::time::Duration;

use crate::retry::BackoffHandler;
use crate::server::ServeError;
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Quic,
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Quic => write!(f, "quic"),
            Protocol::Http2 => write!(f, "http2"),
        }
    }
}

/// Decides which protocol a tunnel starts with and which one it may fall
/// back to. The initial choice is made by a collaborator; the supervisor
/// only reacts to it.
pub trait ProtocolSelector: Send + Sync {
    fn current(&self) -> Protocol;
    fn fallback(&self) -> Option<Protocol>;
}

/// Selector with a fixed answer, for static configurations and tests.
pub struct StaticSelector {
    pub current: Protocol,
    pub fallback: Option<Protocol>,
}

impl ProtocolSelector for StaticSelector {
    fn current(&self) -> Protocol {
        self.current
    }

    fn fallback(&self) -> Option<Protocol> {
        self.fallback
    }
}

/// Per-connection retry pacing plus the protocol the next attempt will
/// use.
///
/// `in_fallback` is true iff the protocol was assigned by [`fallback`]
/// and no [`reset`] has run since.
///
/// [`fallback`]: ProtocolFallback::fallback
/// [`reset`]: ProtocolFallback::reset
pub struct ProtocolFallback {
    backoff: BackoffHandler,
    protocol: Protocol,
    in_fallback: bool,
}

impl ProtocolFallback {
    pub fn new(backoff: BackoffHandler, protocol: Protocol) -> Self {
        Self {
            backoff,
            protocol,
            in_fallback: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn in_fallback(&self) -> bool {
        self.in_fallback
    }

    pub fn max_backoff_duration(&self) -> (Duration, bool) {
        self.backoff.max_backoff_duration()
    }

    pub fn backoff_timer(&mut self) -> Option<tokio::time::Sleep> {
        self.backoff.backoff_timer()
    }

    pub fn reached_max_retries(&self) -> bool {
        self.backoff.reached_max_retries()
    }

    pub fn retries(&self) -> u32 {
        self.backoff.retries()
    }

    /// Called once a connection registered successfully.
    pub fn reset(&mut self) {
        self.backoff.reset_now();
        self.in_fallback = false;
    }

    pub fn fallback(&mut self, protocol: Protocol) {
        self.backoff.reset_now();
        self.protocol = protocol;
        self.in_fallback = true;
    }

    pub(crate) fn sync_with(&mut self, current: Protocol) {
        self.protocol = current;
    }
}

/// Picks the protocol for the next retry iteration.
///
/// Returns true if a protocol was picked, false if we are out of options
/// and should stop retrying.
pub fn select_next_protocol(
    conn_index: u8,
    protocol_backoff: &mut ProtocolFallback,
    selector: &dyn ProtocolSelector,
    cause: Option<&ServeError>,
) -> bool {
    let quic_broken = cause.is_some_and(is_quic_broken);
    let has_fallback = selector.fallback().is_some();

    if protocol_backoff.reached_max_retries() || (has_fallback && quic_broken) {
        if quic_broken {
            tracing::warn!(
                conn_index,
                "Unable to communicate with the edge over quic; the network may be dropping or blocking egress UDP"
            );
        }

        let Some(fallback) = selector.fallback() else {
            return false;
        };

        // Already using the fallback protocol, no point to retry.
        if protocol_backoff.protocol() == fallback {
            return false;
        }

        tracing::info!(conn_index, %fallback, "Switching to fallback protocol");
        protocol_backoff.fallback(fallback);
    } else if !protocol_backoff.in_fallback() {
        // There is no session manager between transports, so the protocol
        // has to follow the selector in case it changed.
        let current = selector.current();
        if protocol_backoff.protocol() != current {
            protocol_backoff.sync_with(current);
        }
    }

    true
}

/// True for the error shapes that indicate quic itself cannot get
/// through: an idle timeout, or a transport error from an egress filter.
fn is_quic_broken(cause: &ServeError) -> bool {
    let connection_error = match cause {
        ServeError::Session(SessionError::Quic(e)) => e,
        ServeError::QuicDial(e) => match e.connection_error() {
            Some(e) => e,
            None => return false,
        },
        ServeError::Session(_)
        | ServeError::Discovery(_)
        | ServeError::Dial(_)
        | ServeError::Reconnect(_)
        | ServeError::Registration(_)
        | ServeError::Canceled
        | ServeError::Panic(_) => return false,
    };

    match connection_error {
        quinn::ConnectionError::TimedOut => true,
        quinn::ConnectionError::TransportError(e) => e.reason.contains("operation not permitted"),
        quinn::ConnectionError::VersionMismatch
        | quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::Reset
        | quinn::ConnectionError::LocallyClosed
        | quinn::ConnectionError::CidsExhausted => false,
    }
}
