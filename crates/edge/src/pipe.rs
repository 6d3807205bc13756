use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, info};
use spectre_lb::Node;
use spectre_transport::{RelayEnd, relay};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    task::{AbortHandle, JoinHandle},
};

use crate::{
    Metrics,
    registry::{ConnectionRegistry, RegistryError, SessionId},
};

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// What happens to the sibling relay once one direction has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Forward the half-close and let the other direction finish on its own.
    Half,
    /// Stop the other direction as well and drop both streams.
    Full,
}

impl CloseMode {
    pub fn from_config(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "half" => Ok(Self::Half),
            "full" => Ok(Self::Full),
            _ => Err(format!("unsupported close mode: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> backend
    Outbound,
    /// backend -> client
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "client->backend"),
            Direction::Inbound => write!(f, "backend->client"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub buffer_size: usize,
    pub close_mode: CloseMode,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            close_mode: CloseMode::Half,
        }
    }
}

#[derive(Debug)]
pub enum PipeError {
    PeerAddress(io::Error),
    Registry(RegistryError),
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::PeerAddress(err) => write!(f, "client address unavailable: {err}"),
            PipeError::Registry(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<RegistryError> for PipeError {
    fn from(err: RegistryError) -> Self {
        PipeError::Registry(err)
    }
}

/// One proxied session: a client stream paired with a backend stream.
///
/// The relay tasks own the stream halves; the registry owns this value.
pub struct ConnectionPipe {
    shared: Arc<PipeShared>,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

pub(crate) struct PipeShared {
    id: SessionId,
    node: Node,
    registry: ConnectionRegistry,
    close_mode: CloseMode,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    bytes_outbound: AtomicU64,
    bytes_inbound: AtomicU64,
}

impl ConnectionPipe {
    /// Registers a session for an accepted client and its dialed backend.
    pub fn open(
        registry: &ConnectionRegistry,
        client: TcpStream,
        backend: TcpStream,
        node: Node,
        options: &RelayOptions,
    ) -> Result<SessionId, PipeError> {
        let id = client.peer_addr().map_err(PipeError::PeerAddress)?;
        Self::open_with_id(registry, id, client, backend, node, options)?;
        Ok(id)
    }

    /// Registers a session under `id` and starts its two relays.
    pub fn open_with_id<C, B>(
        registry: &ConnectionRegistry,
        id: SessionId,
        client: C,
        backend: B,
        node: Node,
        options: &RelayOptions,
    ) -> Result<(), RegistryError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = options.clone();
        registry.insert(id, move |registry| {
            Self::launch(registry, id, client, backend, node, options)
        })
    }

    fn launch<C, B>(
        registry: ConnectionRegistry,
        id: SessionId,
        client: C,
        backend: B,
        node: Node,
        options: RelayOptions,
    ) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);

        let (stop, _) = watch::channel(false);
        // subscribed before spawning so an early stop is never missed
        let outbound_stop = stop.subscribe();
        let inbound_stop = stop.subscribe();

        let shared = Arc::new(PipeShared {
            id,
            node,
            registry,
            close_mode: options.close_mode,
            closed: AtomicBool::new(false),
            stop,
            bytes_outbound: AtomicU64::new(0),
            bytes_inbound: AtomicU64::new(0),
        });

        info!("Session {} opened towards {}", id, shared.node);

        let outbound = tokio::spawn(run_relay(
            shared.clone(),
            Direction::Outbound,
            client_read,
            backend_write,
            options.buffer_size,
            outbound_stop,
        ));
        let inbound = tokio::spawn(run_relay(
            shared.clone(),
            Direction::Inbound,
            backend_read,
            client_write,
            options.buffer_size,
            inbound_stop,
        ));

        Self {
            shared,
            outbound,
            inbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn node(&self) -> &Node {
        &self.shared.node
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn bytes_outbound(&self) -> u64 {
        self.shared.bytes_outbound.load(Ordering::Relaxed)
    }

    pub fn bytes_inbound(&self) -> u64 {
        self.shared.bytes_inbound.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.outbound.is_finished() && self.inbound.is_finished()
    }

    pub(crate) fn handle(&self) -> Arc<PipeShared> {
        self.shared.clone()
    }

    pub(crate) fn abort_handles(&self) -> [AbortHandle; 2] {
        [self.outbound.abort_handle(), self.inbound.abort_handle()]
    }

    pub(crate) async fn join(self) {
        let _ = self.outbound.await;
        let _ = self.inbound.await;
    }
}

impl PipeShared {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Outbound => &self.bytes_outbound,
            Direction::Inbound => &self.bytes_inbound,
        }
    }

    /// `ended` is the relay direction that triggered the close, if any.
    pub(crate) fn close(&self, ended: Option<Direction>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.registry.remove(&self.id);
        Metrics::incr(&self.registry.metrics().sessions_closed);

        if self.close_mode == CloseMode::Full {
            self.stop.send_replace(true);
        }

        match ended {
            Some(direction) => info!(
                "Session {} closed, {} ended first ({} bytes out, {} bytes in)",
                self.id,
                direction,
                self.bytes_outbound.load(Ordering::Relaxed),
                self.bytes_inbound.load(Ordering::Relaxed)
            ),
            None => info!("Session {} closed on request", self.id),
        }
        true
    }
}

async fn run_relay<R, W>(
    shared: Arc<PipeShared>,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    mut stop: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let transferred = shared.counter(direction);

    let end = tokio::select! {
        end = relay(&mut reader, &mut writer, buffer_size, transferred) => end,
        _ = stop.changed() => RelayEnd::Stopped,
    };

    // forward the half-close so the peer sees end of stream
    if matches!(end, RelayEnd::Eof | RelayEnd::ReadError(_)) {
        let _ = writer.shutdown().await;
    }

    let bytes = transferred.load(Ordering::Relaxed);
    let metrics = shared.registry.metrics();
    match direction {
        Direction::Outbound => Metrics::add(&metrics.bytes_client_to_backend, bytes),
        Direction::Inbound => Metrics::add(&metrics.bytes_backend_to_client, bytes),
    }

    debug!(
        "Session {} {} relay finished after {} bytes: {}",
        shared.id, direction, bytes, end
    );

    shared.close(Some(direction));
}
