//! Accept loop, session pipes and the session registry of the balancer.
//!
//! ```text
//! client -> Acceptor -> BackendSet::next -> dial -> ConnectionPipe -> ConnectionRegistry
//!                                                      |
//!                                        outbound relay + inbound relay tasks
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

pub mod acceptor;
pub mod pipe;
pub mod registry;

pub use acceptor::{AcceptFailure, Acceptor, AcceptorError, AcceptorOptions, AcceptorState};
pub use pipe::{CloseMode, ConnectionPipe, Direction, PipeError, RelayOptions};
pub use registry::{ConnectionRegistry, RegistryError, SessionId};

/// Process-wide counters, shared by the acceptor and every pipe.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_accepted: AtomicU64,
    pub accept_errors: AtomicU64,
    pub dial_failures: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub bytes_client_to_backend: AtomicU64,
    pub bytes_backend_to_client: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub accept_errors: u64,
    pub dial_failures: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            bytes_client_to_backend: self.bytes_client_to_backend.load(Ordering::Relaxed),
            bytes_backend_to_client: self.bytes_backend_to_client.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}
