//! TLS session: an accepted connection that handshakes before any bytes
//! reach the user handler.

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
    ReceiveBuffer, SendQueue, WireEvent, is_benign_tls_disconnect,
};

use crate::server::TlsServerShared;

/// Notification hooks for a [`TlsSession`].
#[async_trait]
pub trait TlsSessionHandler: Send + Sync + 'static {
    /// The transport connection is established; the handshake follows.
    async fn on_connected(&self, _session: &TlsSession) {}
    /// The TLS handshake completed; receiving may begin.
    async fn on_handshaked(&self, _session: &TlsSession) {}
    /// The session disconnected; it is about to be unregistered.
    async fn on_disconnected(&self, _session: &TlsSession) {}
    /// Another chunk of decrypted data arrived; return the consumed prefix.
    async fn on_received(&self, _session: &TlsSession, buffer: &[u8]) -> usize {
        buffer.len()
    }
    /// Another chunk of the send queue reached the OS.
    async fn on_sent(&self, _session: &TlsSession, _sent: usize, _pending: usize) {}
    /// The send queue is fully drained.
    async fn on_empty(&self, _session: &TlsSession) {}
    /// A non-benign transport or handshake error occurred.
    fn on_error(&self, _session: &TlsSession, _error: &Error) {}
}

/// No-op session hooks.
#[derive(Debug, Default)]
pub struct NullTlsSessionHandler;

impl TlsSessionHandler for NullTlsSessionHandler {}

pub(crate) struct SessionInner {
    pub(crate) id: EndpointId,
    pub(crate) server: Weak<TlsServerShared>,
    pub(crate) state: AtomicEndpointState,
    pub(crate) stats: EndpointStats,
    pub(crate) options: EndpointOptions,
    pub(crate) queue: SendQueue,
    pub(crate) shutdown: CancellationToken,
    pub(crate) drained: Notify,
    peer: SocketAddr,
    local: SocketAddr,
}

/// Server-side representation of one accepted TLS connection.
#[derive(Clone)]
pub struct TlsSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl TlsSession {
    pub(crate) fn new(
        server: Weak<TlsServerShared>,
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

    /// Whether the transport connection is established.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            EndpointState::Connected | EndpointState::Handshaking | EndpointState::Handshaked
        )
    }

    /// Whether the TLS handshake completed.
    pub fn is_handshaked(&self) -> bool {
        self.state() == EndpointState::Handshaked
    }

    /// Transfer statistics for this connection epoch.
    pub fn stats(&self) -> nexio_core::StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The options this session was accepted with.
    pub fn options(&self) -> &EndpointOptions {
        &self.inner.options
    }

    /// Append data to the send queue; the reactor encrypts and drains it
    /// asynchronously.
    pub fn send_async(&self, data: &[u8]) -> bool {
        if !self.is_handshaked() {
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
    /// from outside the service's worker threads.
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

    /// Disconnect the session; teardown happens on the driver task.
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

    /// Drive this session: TLS accept, then the writer task plus the
    /// receive/event loop. All handler invocations happen here.
    pub(crate) async fn run(
        self,
        stream: TcpStream,
        handler: Arc<dyn TlsSessionHandler>,
        receive_capacity: usize,
        send_capacity: usize,
    ) {
        let inner = Arc::clone(&self.inner);
        let server = inner.server.upgrade();

        inner.stats.reset();
        inner.queue.reserve(send_capacity);
        inner.state.store(EndpointState::Connected);
        handler.on_connected(&self).await;
        if let Some(server) = &server {
            server.handler().on_connected(&self).await;
        }

        // Pre-handshake step: failure is fatal for this session.
        let acceptor = match server.as_ref().map(|server| server.acceptor.clone()) {
            Some(acceptor) => acceptor,
            None => return self.teardown(handler, server, None).await,
        };
        inner.state.store(EndpointState::Handshaking);
        let tls = tokio::select! {
            () = inner.shutdown.cancelled() => {
                return self.teardown(handler, server, None).await;
            }
            accepted = acceptor.accept(stream) => match accepted {
                Ok(tls) => tls,
                Err(e) => {
                    let error = if is_benign_tls_disconnect(&e) {
                        None
                    } else {
                        Some(Error::HandshakeFailed(e.to_string()))
                    };
                    return self.teardown(handler, server, error).await;
                }
            },
        };
        inner.state.store(EndpointState::Handshaked);
        debug!(session = %inner.id, peer = %inner.peer, "session handshaked");
        handler.on_handshaked(&self).await;
        if let Some(server) = &server {
            server.handler().on_handshaked(&self).await;
        }

        let (mut read_half, mut write_half) = tokio::io::split(tls);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut receive_buffer =
            ReceiveBuffer::new(receive_capacity, inner.options.receive_buffer_limit);

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
                        if !is_benign_tls_disconnect(&e) {
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
                        Err(Error::Io(e)) if is_benign_tls_disconnect(&e) => break,
                        Err(e) => {
                            error = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        inner.queue.close(&inner.stats);
        writer.abort();
        let _ = writer.await;
        drop(read_half);
        self.teardown(handler, server, error).await;
    }

    async fn teardown(
        &self,
        handler: Arc<dyn TlsSessionHandler>,
        server: Option<Arc<TlsServerShared>>,
        error: Option<Error>,
    ) {
        let inner = &self.inner;
        inner.state.store(EndpointState::Disconnecting);
        inner.queue.close(&inner.stats);
        inner.shutdown.cancel();

        if let Some(error) = &error {
            handler.on_error(self, error);
            if let Some(server) = &server {
                server.handler().on_error(error);
            }
        }

        inner.state.store(EndpointState::Disconnected);
        inner.drained.notify_one();
        debug!(session = %inner.id, peer = %inner.peer, "session disconnected");
        handler.on_disconnected(self).await;
        if let Some(server) = &server {
            server.handler().on_disconnected(self).await;
            server.unregister(inner.id, &inner.stats);
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}
