//! TCP session: one accepted connection driven by its own actor task.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nexio_core::{
    AtomicEndpointState, EndpointId, EndpointOptions, EndpointState, EndpointStats, Enqueue, Error,
    ReceiveBuffer, SendQueue, WireEvent, is_benign_disconnect,
};

use crate::server::ServerShared;

/// Notification hooks for a [`TcpSession`]. All methods have defaults; the
/// session's driver task invokes them strictly in order.
#[async_trait]
pub trait TcpSessionHandler: Send + Sync + 'static {
    /// The session is connected and registered with its server.
    async fn on_connected(&self, _session: &TcpSession) {}
    /// The session disconnected; it is about to be unregistered.
    async fn on_disconnected(&self, _session: &TcpSession) {}
    /// Another chunk of data arrived. The whole unconsumed buffer is
    /// presented; return how many prefix bytes were handled (they are
    /// erased). Return less than `buffer.len()` to wait for more data.
    async fn on_received(&self, _session: &TcpSession, buffer: &[u8]) -> usize {
        buffer.len()
    }
    /// Another chunk of the send queue reached the OS.
    async fn on_sent(&self, _session: &TcpSession, _sent: usize, _pending: usize) {}
    /// The send queue is fully drained.
    async fn on_empty(&self, _session: &TcpSession) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _session: &TcpSession, _error: &Error) {}
}

/// No-op session hooks.
#[derive(Debug, Default)]
pub struct NullSessionHandler;

impl TcpSessionHandler for NullSessionHandler {}

pub(crate) struct SessionInner {
    pub(crate) id: EndpointId,
    pub(crate) server: Weak<ServerShared>,
    pub(crate) state: AtomicEndpointState,
    pub(crate) stats: EndpointStats,
    pub(crate) options: EndpointOptions,
    pub(crate) queue: SendQueue,
    pub(crate) shutdown: CancellationToken,
    pub(crate) drained: Notify,
    peer: SocketAddr,
    local: SocketAddr,
}

/// Server-side representation of one accepted TCP connection.
///
/// Cloning is cheap and refers to the same connection.
#[derive(Clone)]
pub struct TcpSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl TcpSession {
    pub(crate) fn new(
        server: Weak<ServerShared>,
        options: EndpointOptions,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        let queue = SendQueue::new(options.send_buffer_limit);
        Self {
            inner: Arc::new(SessionInner {
                id: EndpointId::generate(),
                server,
                state: AtomicEndpointState::new(EndpointState::Connecting),
                stats: EndpointStats::new(),
                options,
                queue,
                shutdown: CancellationToken::new(),
                drained: Notify::new(),
                peer,
                local,
            }),
        }
    }

    /// The session identifier.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// The identifier of the owning server, while it is alive.
    pub fn server_id(&self) -> Option<EndpointId> {
        self.inner.server.upgrade().map(|server| server.id)
    }

    /// Remote peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Local socket address.
    pub fn local_address(&self) -> SocketAddr {
        self.inner.local
    }

    /// Current life-cycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.state.load()
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            EndpointState::Connected | EndpointState::Handshaking | EndpointState::Handshaked
        )
    }

    /// Transfer statistics for this connection epoch.
    pub fn stats(&self) -> nexio_core::StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Bytes accepted for sending but not yet written.
    pub fn bytes_pending(&self) -> u64 {
        self.inner
            .stats
            .bytes_pending
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// The options this session was accepted with.
    pub fn options(&self) -> &EndpointOptions {
        &self.inner.options
    }

    /// Append data to the send queue; the reactor drains it asynchronously.
    /// Returns `false` when the session is not connected or the append
    /// exceeded the configured send buffer limit (which disconnects).
    pub fn send_async(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.inner.queue.enqueue(data, &self.inner.stats) {
            Enqueue::Queued { .. } | Enqueue::InFlight { .. } => true,
            Enqueue::LimitExceeded { pending, limit } => {
                warn!(
                    session = %self.inner.id,
                    pending, limit, "send buffer limit exceeded; disconnecting"
                );
                self.disconnect();
                false
            }
            Enqueue::Closed => false,
        }
    }

    /// Send data and block until the queue fully drains. Must be called
    /// from outside the service's worker threads (use
    /// [`send_async`](Self::send_async) in handlers).
    pub fn send(&self, data: &[u8]) -> Result<usize, Error> {
        self.send_with_deadline(data, None)
    }

    /// As [`send`](Self::send) with a bound on the blocking time.
    pub fn send_timeout(&self, data: &[u8], timeout: Duration) -> Result<usize, Error> {
        self.send_with_deadline(data, Some(timeout))
    }

    fn send_with_deadline(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize, Error> {
        if !self.send_async(data) {
            return Err(Error::NotConnected);
        }
        let service = self
            .inner
            .server
            .upgrade()
            .ok_or(Error::NotConnected)?
            .service
            .clone();
        let inner = Arc::clone(&self.inner);
        let wait = async move {
            loop {
                if inner.queue.is_idle() || inner.queue.is_closed() {
                    return;
                }
                inner.drained.notified().await;
            }
        };
        service.block_on(async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, wait)
                    .await
                    .map_err(|_| Error::Timeout),
                None => {
                    wait.await;
                    Ok(())
                }
            }
        })??;
        Ok(data.len())
    }

    /// Disconnect the session. The teardown is performed by the driver
    /// task; `on_disconnected` fires once it completes.
    pub fn disconnect(&self) -> bool {
        if !matches!(
            self.state(),
            EndpointState::Connecting
                | EndpointState::Connected
                | EndpointState::Handshaking
                | EndpointState::Handshaked
        ) {
            return false;
        }
        self.inner.state.store(EndpointState::Disconnecting);
        self.inner.shutdown.cancel();
        true
    }

    /// Drive this session: writer task plus the receive/event loop. All
    /// handler invocations happen here, serialized.
    pub(crate) async fn run(
        self,
        stream: TcpStream,
        handler: Arc<dyn TcpSessionHandler>,
        receive_capacity: usize,
        send_capacity: usize,
    ) {
        let inner = Arc::clone(&self.inner);
        let (mut read_half, mut write_half) = stream.into_split();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        inner.stats.reset();
        inner.queue.reserve(send_capacity);
        let mut receive_buffer =
            ReceiveBuffer::new(receive_capacity, inner.options.receive_buffer_limit);

        inner.state.store(EndpointState::Connected);
        debug!(session = %inner.id, peer = %inner.peer, "session connected");

        let server = inner.server.upgrade();
        handler.on_connected(&self).await;
        if let Some(server) = &server {
            server.handler().on_connected(&self).await;
        }

        // The writer task owns the flush buffer; its completions land in
        // this task's mailbox.
        let writer = {
            let session = self.clone();
            let events = events_tx.clone();
            tokio::spawn(async move {
                let inner = &session.inner;
                match inner
                    .queue
                    .drain(&mut write_half, &inner.stats, &events)
                    .await
                {
                    Ok(()) => {
                        let _ = write_half.shutdown().await;
                    }
                    Err(e) => {
                        let _ = events.send(WireEvent::WriteError(e));
                    }
                }
            })
        };

        let mut error: Option<Error> = None;
        loop {
            tokio::select! {
                () = inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(WireEvent::Sent { sent, pending }) => {
                        handler.on_sent(&self, sent, pending).await;
                    }
                    Some(WireEvent::Empty) => {
                        inner.drained.notify_one();
                        handler.on_empty(&self).await;
                    }
                    Some(WireEvent::WriteError(e)) => {
                        if !is_benign_disconnect(&e) {
                            error = Some(e.into());
                        }
                        break;
                    }
                    None => break,
                },
                received = receive_buffer.read_from(&mut read_half, &inner.stats) => {
                    match received {
                        Ok(0) => break,
                        Ok(_) => {
                            let consumed =
                                handler.on_received(&self, receive_buffer.as_slice()).await;
                            receive_buffer.consume(consumed);
                        }
                        Err(Error::Io(e)) if is_benign_disconnect(&e) => break,
                        Err(e) => {
                            error = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        inner.state.store(EndpointState::Disconnecting);
        inner.queue.close(&inner.stats);
        inner.shutdown.cancel();
        writer.abort();
        let _ = writer.await;
        drop(read_half);

        if let Some(error) = &error {
            handler.on_error(&self, error);
            if let Some(server) = &server {
                server.handler().on_error(error);
            }
        }

        inner.state.store(EndpointState::Disconnected);
        inner.drained.notify_one();
        debug!(session = %inner.id, peer = %inner.peer, "session disconnected");
        handler.on_disconnected(&self).await;
        if let Some(server) = &server {
            server.handler().on_disconnected(&self).await;
            server.unregister(inner.id, &inner.stats);
        }
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}
