use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{Metrics, pipe::ConnectionPipe};

/// A session is keyed by the client's remote address.
pub type SessionId = SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateSession(SessionId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateSession(id) => {
                write!(f, "session {id} is already registered")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Active sessions, the only state shared between the acceptor and relays.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    pipes: Mutex<HashMap<SessionId, ConnectionPipe>>,
    // unregistered pipes whose relays have not both finished yet
    closing: Mutex<Vec<ConnectionPipe>>,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    fn pipes(&self) -> MutexGuard<'_, HashMap<SessionId, ConnectionPipe>> {
        self.inner
            .pipes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn closing(&self) -> MutexGuard<'_, Vec<ConnectionPipe>> {
        self.inner
            .closing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the pipe built by `launch` under `id`.
    ///
    /// `launch` runs while the registry lock is held, so any relay task it
    /// starts cannot remove its entry before the entry exists. On a duplicate
    /// id `launch` is never called.
    pub fn insert<F>(&self, id: SessionId, launch: F) -> Result<(), RegistryError>
    where
        F: FnOnce(ConnectionRegistry) -> ConnectionPipe,
    {
        let mut pipes = self.pipes();
        if pipes.contains_key(&id) {
            error!("Session {} is already registered, refusing the new pipe", id);
            return Err(RegistryError::DuplicateSession(id));
        }

        pipes.insert(id, launch(self.clone()));
        Metrics::incr(&self.inner.metrics.sessions_opened);
        debug!("Registered session {} ({} active)", id, pipes.len());
        Ok(())
    }

    /// Removes `id`; absent ids are ignored.
    ///
    /// The removed pipe stays tracked until both of its relays finish, so
    /// `drain_all` still waits for a direction that outlives the session.
    pub fn remove(&self, id: &SessionId) -> bool {
        let Some(pipe) = self.pipes().remove(id) else {
            return false;
        };
        debug!("Unregistered session {}", id);

        let mut closing = self.closing();
        closing.retain(|pipe| !pipe.is_finished());
        if !pipe.is_finished() {
            closing.push(pipe);
        }
        true
    }

    /// Number of unregistered pipes with a relay still running.
    pub fn closing_len(&self) -> usize {
        self.closing().iter().filter(|pipe| !pipe.is_finished()).count()
    }

    /// Closes the pipe registered under `id`, as if one of its relays ended.
    pub fn close(&self, id: &SessionId) -> bool {
        let pipe = self.pipes().get(id).map(ConnectionPipe::handle);
        match pipe {
            Some(pipe) => pipe.close(None),
            None => false,
        }
    }

    /// Runs `f` on the pipe registered under `id`.
    ///
    /// `f` runs under the registry lock and must not call back into the
    /// registry.
    pub fn inspect<R, F>(&self, id: &SessionId, f: F) -> Option<R>
    where
        F: FnOnce(&ConnectionPipe) -> R,
    {
        self.pipes().get(id).map(f)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.pipes().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pipes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes().is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.pipes().keys().copied().collect()
    }

    /// Takes every registered pipe, plus the unregistered ones still
    /// relaying, and waits for all of their relays.
    ///
    /// With a `timeout`, relays still running once it elapses are aborted.
    /// Returns the number of pipes drained.
    pub async fn drain_all(&self, timeout: Option<Duration>) -> usize {
        let mut pipes: Vec<ConnectionPipe> = self.pipes().drain().map(|(_, pipe)| pipe).collect();
        let registered = pipes.len();
        pipes.extend(self.closing().drain(..).filter(|pipe| !pipe.is_finished()));

        let count = pipes.len();
        if count == 0 {
            return 0;
        }

        info!(
            "Draining {} sessions ({} already closing)",
            count,
            count - registered
        );
        let abort_handles: Vec<_> = pipes.iter().flat_map(ConnectionPipe::abort_handles).collect();
        let wait = async move {
            for pipe in pipes {
                pipe.join().await;
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => {
                let finished = tokio::time::timeout(limit, wait).await.is_ok();
                if !finished {
                    let stuck = abort_handles.iter().filter(|h| !h.is_finished()).count();
                    warn!(
                        "Drain timed out after {}ms, aborting {} relays",
                        limit.as_millis(),
                        stuck
                    );
                    for handle in &abort_handles {
                        handle.abort();
                    }
                }
            }
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spectre_lb::Node;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::pipe::RelayOptions;

    fn session(port: u16) -> SessionId {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn removing_unknown_session_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.remove(&session(1)));
        assert!(!registry.remove(&session(1)));
        assert!(!registry.close(&session(1)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_session_is_rejected_without_launching() {
        let registry = ConnectionRegistry::new();
        let (_client, client_side) = duplex(64);
        let (backend_side, _backend) = duplex(64);

        ConnectionPipe::open_with_id(
            &registry,
            session(4000),
            client_side,
            backend_side,
            Node::new("backend", 80),
            &RelayOptions::default(),
        )
        .unwrap();

        let err = registry
            .insert(session(4000), |_| panic!("duplicate must not launch"))
            .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateSession(session(4000)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.metrics().snapshot().sessions_opened, 1);
    }

    #[tokio::test]
    async fn drain_of_empty_registry_returns_immediately() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.drain_all(None).await, 0);
    }

    #[tokio::test]
    async fn drain_waits_for_both_relays() {
        let registry = ConnectionRegistry::new();
        let (client, client_side) = duplex(64);
        let (backend_side, backend) = duplex(64);

        ConnectionPipe::open_with_id(
            &registry,
            session(4001),
            client_side,
            backend_side,
            Node::new("backend", 80),
            &RelayOptions::default(),
        )
        .unwrap();

        let drain = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.drain_all(None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished());
        assert!(registry.is_empty());

        drop(client);
        drop(backend);

        let drained = tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("drain did not finish")
            .unwrap();
        assert_eq!(drained, 1);
    }

    #[tokio::test]
    async fn drain_waits_for_relay_outliving_half_closed_session() {
        let registry = ConnectionRegistry::new();
        let (mut client, client_side) = duplex(64);
        let (backend_side, mut backend) = duplex(64);

        ConnectionPipe::open_with_id(
            &registry,
            session(4003),
            client_side,
            backend_side,
            Node::new("backend", 80),
            &RelayOptions::default(),
        )
        .unwrap();

        client.write_all(b"req").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        backend.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"req");

        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session was not unregistered");
        assert_eq!(registry.closing_len(), 1);

        let drain = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.drain_all(None).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!drain.is_finished());

        backend.write_all(b"response").await.unwrap();
        drop(backend);

        let drained = tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("drain did not finish")
            .unwrap();
        assert_eq!(drained, 1);
        assert_eq!(registry.closing_len(), 0);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
    }

    #[tokio::test]
    async fn finished_pipes_are_not_kept_as_closing() {
        let registry = ConnectionRegistry::new();
        let (client, client_side) = duplex(64);
        let (backend_side, backend) = duplex(64);

        ConnectionPipe::open_with_id(
            &registry,
            session(4004),
            client_side,
            backend_side,
            Node::new("backend", 80),
            &RelayOptions::default(),
        )
        .unwrap();

        drop(client);
        drop(backend);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() || registry.closing_len() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relays did not finish");
        assert_eq!(registry.drain_all(None).await, 0);
    }

    #[tokio::test]
    async fn drain_timeout_aborts_stuck_relays() {
        let registry = ConnectionRegistry::new();
        let (mut client, client_side) = duplex(64);
        let (backend_side, _backend) = duplex(64);

        ConnectionPipe::open_with_id(
            &registry,
            session(4002),
            client_side,
            backend_side,
            Node::new("backend", 80),
            &RelayOptions::default(),
        )
        .unwrap();

        let drained = registry.drain_all(Some(Duration::from_millis(50))).await;
        assert_eq!(drained, 1);

        // aborted relays drop their halves, so the client observes EOF
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client side was not released")
            .unwrap();
        assert_eq!(read, 0);
    }
}
