use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};
use spectre_config::config::Config;
use spectre_lb::BackendSet;
use spectre_transport::dial;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinError, JoinSet},
};

use crate::{
    Metrics,
    pipe::{CloseMode, ConnectionPipe, PipeError, RelayOptions},
    registry::{ConnectionRegistry, RegistryError, SessionId},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Listening,
    Accepting,
    Terminating,
}

/// How the accept loop reacts to a failed `accept()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// The client went away mid-handshake; accept again right away.
    ClientGone,
    /// Anything else, e.g. descriptor exhaustion; pause before retrying.
    Backoff,
}

impl AcceptFailure {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                AcceptFailure::ClientGone
            }
            _ => AcceptFailure::Backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub relay: RelayOptions,
    pub connect_timeout: Duration,
    /// `None` waits for every session to finish on shutdown.
    pub drain_timeout: Option<Duration>,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            relay: RelayOptions::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: None,
        }
    }
}

impl AcceptorOptions {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        Ok(Self {
            relay: RelayOptions {
                buffer_size: config.relay.buffer_size,
                close_mode: CloseMode::from_config(&config.relay.close_mode)?,
            },
            connect_timeout: Duration::from_millis(config.relay.connect_timeout_ms),
            drain_timeout: config.relay.drain_timeout_ms.map(Duration::from_millis),
        })
    }
}

#[derive(Debug)]
pub enum AcceptorError {
    Bind { address: String, source: io::Error },
    DuplicateSession(SessionId),
}

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorError::Bind { address, source } => {
                write!(f, "failed to listen on {address}: {source}")
            }
            AcceptorError::DuplicateSession(id) => {
                write!(f, "session {id} registered twice")
            }
        }
    }
}

impl std::error::Error for AcceptorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcceptorError::Bind { source, .. } => Some(source),
            AcceptorError::DuplicateSession(_) => None,
        }
    }
}

/// Accepts clients and hands each one to a backend from the rotation.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    backends: Arc<BackendSet>,
    registry: ConnectionRegistry,
    options: AcceptorOptions,
    state: watch::Sender<AcceptorState>,
    // dial + registration of freshly accepted clients
    pending: JoinSet<Result<(), PipeError>>,
}

impl Acceptor {
    pub async fn bind(
        address: &str,
        backends: BackendSet,
        options: AcceptorOptions,
    ) -> Result<Self, AcceptorError> {
        let bind_error = |source| AcceptorError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            "Listening on {} with {} backends ({})",
            local_addr,
            backends.len(),
            backends
                .nodes()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let (state, _) = watch::channel(AcceptorState::Listening);

        Ok(Self {
            listener,
            local_addr,
            backends: Arc::new(backends),
            registry: ConnectionRegistry::new(),
            options,
            state,
            pending: JoinSet::new(),
        })
    }

    /// Binds `address` and runs until `shutdown` resolves.
    pub async fn serve<F>(
        address: &str,
        backends: BackendSet,
        options: AcceptorOptions,
        shutdown: F,
    ) -> Result<(), AcceptorError>
    where
        F: Future<Output = ()>,
    {
        Self::bind(address, backends, options).await?.run(shutdown).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.registry.metrics().clone()
    }

    pub fn state(&self) -> watch::Receiver<AcceptorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AcceptorState) {
        self.state.send_replace(state);
        debug!("Acceptor on {} is now {:?}", self.local_addr, state);
    }

    /// Accepts until `shutdown` resolves, then drains the open sessions.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), AcceptorError>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        self.set_state(AcceptorState::Accepting);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(joined) = self.pending.join_next(), if !self.pending.is_empty() => {
                    Self::reap(joined)?;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer)) => self.route(client, peer),
                    Err(err) => self.accept_failed(err).await,
                },
            }
        }

        self.set_state(AcceptorState::Terminating);
        info!("Shutdown requested, no longer accepting on {}", self.local_addr);

        while let Some(joined) = self.pending.join_next().await {
            Self::reap(joined)?;
        }

        let drained = self.registry.drain_all(self.options.drain_timeout).await;
        info!("Acceptor on {} stopped after draining {} sessions", self.local_addr, drained);
        Ok(())
    }

    fn route(&mut self, client: TcpStream, peer: SocketAddr) {
        let metrics = self.registry.metrics().clone();
        Metrics::incr(&metrics.connections_accepted);

        if let Err(err) = client.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, err);
        }

        // picked here so the rotation follows accept order
        let node = self.backends.next();
        info!("Routing {} -> {}", peer, node);

        let registry = self.registry.clone();
        let connect_timeout = self.options.connect_timeout;
        let relay = self.options.relay.clone();

        self.pending.spawn(async move {
            let backend = match dial(&node, connect_timeout).await {
                Ok(backend) => backend,
                Err(err) => {
                    Metrics::incr(&metrics.dial_failures);
                    // dropping `client` closes it
                    warn!("Dropping client {}: {}", peer, err);
                    return Ok(());
                }
            };

            match ConnectionPipe::open(&registry, client, backend, node, &relay) {
                Ok(_) => Ok(()),
                Err(PipeError::PeerAddress(err)) => {
                    warn!("Client {} went away before its session opened: {}", peer, err);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        });
    }

    async fn accept_failed(&self, err: io::Error) {
        Metrics::incr(&self.registry.metrics().accept_errors);

        match AcceptFailure::classify(&err) {
            AcceptFailure::ClientGone => {
                warn!("Client went away during accept: {}", err);
            }
            AcceptFailure::Backoff => {
                error!("Accept error on {}: {}", self.local_addr, err);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    fn reap(joined: Result<Result<(), PipeError>, JoinError>) -> Result<(), AcceptorError> {
        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PipeError::Registry(RegistryError::DuplicateSession(id)))) => {
                error!("Session {} was registered twice, stopping", id);
                Err(AcceptorError::DuplicateSession(id))
            }
            Ok(Err(err)) => {
                warn!("Connection setup failed: {}", err);
                Ok(())
            }
            Err(err) => {
                error!("Connection setup task failed: {}", err);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let mut config = Config::default();
        config.relay.buffer_size = 1024;
        config.relay.close_mode = "full".to_string();
        config.relay.connect_timeout_ms = 750;
        config.relay.drain_timeout_ms = Some(3000);

        let options = AcceptorOptions::from_config(&config).unwrap();
        assert_eq!(options.relay.buffer_size, 1024);
        assert_eq!(options.relay.close_mode, CloseMode::Full);
        assert_eq!(options.connect_timeout, Duration::from_millis(750));
        assert_eq!(options.drain_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn unknown_close_mode_is_rejected() {
        let mut config = Config::default();
        config.relay.close_mode = "eventually".to_string();
        assert!(AcceptorOptions::from_config(&config).is_err());
    }

    #[test]
    fn vanished_clients_do_not_back_off() {
        for kind in [io::ErrorKind::ConnectionAborted, io::ErrorKind::ConnectionReset] {
            let err = io::Error::new(kind, "client gone");
            assert_eq!(AcceptFailure::classify(&err), AcceptFailure::ClientGone);
        }

        for kind in [
            io::ErrorKind::Other,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::OutOfMemory,
        ] {
            let err = io::Error::new(kind, "accept failed");
            assert_eq!(AcceptFailure::classify(&err), AcceptFailure::Backoff);
        }
    }

    #[tokio::test]
    async fn accept_errors_are_counted() {
        let backends = BackendSet::from_config(&["127.0.0.1:9"]).unwrap();
        let acceptor = Acceptor::bind("127.0.0.1:0", backends, AcceptorOptions::default())
            .await
            .unwrap();

        let started = std::time::Instant::now();
        acceptor
            .accept_failed(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .await;
        assert!(started.elapsed() < ACCEPT_ERROR_BACKOFF);
        assert_eq!(acceptor.metrics().snapshot().accept_errors, 1);

        let started = std::time::Instant::now();
        acceptor
            .accept_failed(io::Error::other("too many open files"))
            .await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
        assert_eq!(acceptor.metrics().snapshot().accept_errors, 2);
    }

    #[test]
    fn duplicate_session_stops_the_acceptor() {
        let id = SessionId::from(([127, 0, 0, 1], 4100));
        let joined = Ok(Err(PipeError::Registry(RegistryError::DuplicateSession(id))));
        match Acceptor::reap(joined) {
            Err(AcceptorError::DuplicateSession(failed)) => assert_eq!(failed, id),
            other => panic!("unexpected result: {other:?}"),
        }

        let gone = Ok(Err(PipeError::PeerAddress(io::Error::from(io::ErrorKind::NotConnected))));
        assert!(Acceptor::reap(gone).is_ok());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let backends = BackendSet::from_config(&["127.0.0.1:9"]).unwrap();

        let err = Acceptor::bind(&address, backends, AcceptorOptions::default())
            .await
            .err()
            .expect("second bind should fail");

        match err {
            AcceptorError::Bind { address: failed, .. } => assert_eq!(failed, address),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn acceptor_starts_listening() {
        let backends = BackendSet::from_config(&["127.0.0.1:9"]).unwrap();
        let acceptor = Acceptor::bind("127.0.0.1:0", backends, AcceptorOptions::default())
            .await
            .unwrap();

        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(*acceptor.state().borrow(), AcceptorState::Listening);
        assert!(acceptor.registry().is_empty());
    }

    #[tokio::test]
    async fn immediate_shutdown_returns_cleanly() {
        let backends = BackendSet::from_config(&["127.0.0.1:9"]).unwrap();
        let acceptor = Acceptor::bind("127.0.0.1:0", backends, AcceptorOptions::default())
            .await
            .unwrap();
        let mut state = acceptor.state();

        acceptor.run(async {}).await.unwrap();
        assert_eq!(*state.borrow_and_update(), AcceptorState::Terminating);
    }
}
