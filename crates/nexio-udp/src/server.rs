//! UDP server: a bound datagram endpoint with an optional multicast target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nexio_core::{
    EndpointId, EndpointOptions, EndpointStats, Error, Result, Service, StatsSnapshot,
};

use crate::socket;

/// Receive chunk growth per iteration of the receive chain.
pub(crate) const RECEIVE_CHUNK: usize = 8192;

/// Notification hooks for a [`UdpServer`].
#[async_trait]
pub trait UdpServerHandler: Send + Sync + 'static {
    /// The socket is bound and the receive chain is running.
    async fn on_started(&self, _server: &UdpServer) {}
    /// The socket closed.
    async fn on_stopped(&self, _server: &UdpServer) {}
    /// A datagram arrived from `peer`.
    async fn on_received(&self, _server: &UdpServer, _peer: SocketAddr, _data: &[u8]) {}
    /// A datagram to `peer` was handed to the OS.
    async fn on_sent(&self, _server: &UdpServer, _peer: SocketAddr, _size: usize) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _error: &Error) {}
}

/// No-op server hooks.
#[derive(Debug, Default)]
pub struct NullUdpServerHandler;

impl UdpServerHandler for NullUdpServerHandler {}

/// Send completions routed through the driver so handlers stay serialized.
enum Event {
    Sent { peer: SocketAddr, size: usize },
}

struct ServerInner {
    id: EndpointId,
    service: Service,
    address: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    options: Mutex<EndpointOptions>,
    handler: Mutex<Arc<dyn UdpServerHandler>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    multicast_target: Mutex<Option<SocketAddr>>,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stats: EndpointStats,
    started: AtomicBool,
    stop: Mutex<Option<CancellationToken>>,
}

/// UDP server endpoint. Cloning is cheap and shares the server.
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<ServerInner>,
}

impl UdpServer {
    /// Create a server bound to `address` once started.
    #[must_use]
    pub fn new(service: &Service, address: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                id: EndpointId::generate(),
                service: service.clone(),
                address,
                bound: Mutex::new(None),
                options: Mutex::new(EndpointOptions::default()),
                handler: Mutex::new(Arc::new(NullUdpServerHandler)),
                socket: Mutex::new(None),
                multicast_target: Mutex::new(None),
                events: Mutex::new(None),
                stats: EndpointStats::new(),
                started: AtomicBool::new(false),
                stop: Mutex::new(None),
            }),
        }
    }

    /// The server identifier.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// The reactor service this server is bound to.
    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// The configured bind address.
    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// The actual bound address (resolves port 0), once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock()
    }

    /// Install the server handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn UdpServerHandler>) {
        *self.inner.handler.lock() = handler;
    }

    /// Replace the endpoint options applied at `start`.
    pub fn set_options(&self, options: EndpointOptions) {
        *self.inner.options.lock() = options;
    }

    /// Current endpoint options.
    pub fn options(&self) -> EndpointOptions {
        self.inner.options.lock().clone()
    }

    /// Whether the receive chain is running.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Transfer statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Bind and start the receive chain.
    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::Configuration("server is already started".into()));
        }
        let options = self.options();
        let handle = self.inner.service.handle()?;
        let socket = Arc::new(socket::build_socket(self.inner.address, &options, &handle)?);
        *self.inner.bound.lock() = Some(socket.local_addr()?);
        *self.inner.socket.lock() = Some(Arc::clone(&socket));
        self.inner.stats.reset();

        let token = CancellationToken::new();
        *self.inner.stop.lock() = Some(token.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.inner.events.lock() = Some(events_tx);
        self.inner.started.store(true, Ordering::Release);
        info!(server = %self.inner.id, bound = ?self.inner.bound.lock(), "UDP server started");

        let server = self.clone();
        self.inner.service.spawn(async move {
            let handler = server.inner.handler.lock().clone();
            handler.on_started(&server).await;
            server.receive_loop(socket, handler, events_rx, token).await;
        });
        Ok(())
    }

    /// As [`start`](Self::start), recording a multicast target for
    /// [`multicast`](Self::multicast).
    pub fn start_multicast(&self, group: SocketAddr) -> Result<()> {
        *self.inner.multicast_target.lock() = Some(group);
        self.start()
    }

    /// Close the socket and stop the receive chain.
    pub fn stop(&self) -> bool {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(token) = self.inner.stop.lock().take() {
            token.cancel();
        }
        *self.inner.socket.lock() = None;
        *self.inner.events.lock() = None;
        *self.inner.bound.lock() = None;
        info!(server = %self.inner.id, "UDP server stopped");
        true
    }

    /// `stop` then `start` with the retained configuration.
    pub fn restart(&self) -> Result<()> {
        if !self.stop() {
            return Err(Error::Configuration("server is not started".into()));
        }
        self.start()
    }

    /// Send one datagram synchronously. Must be called from outside the
    /// service's worker threads.
    pub fn send(&self, peer: SocketAddr, data: &[u8]) -> Result<usize> {
        let socket = self.socket_handle()?;
        let owned = data.to_vec();
        let sent = self
            .inner
            .service
            .block_on(async move { socket.send_to(&owned, peer).await })??;
        self.record_sent(peer, sent);
        Ok(sent)
    }

    /// Post one datagram; the completion is reported through `on_sent`.
    /// UDP keeps no send queue: datagram boundaries preclude coalescing,
    /// the caller controls the rate.
    pub fn send_async(&self, peer: SocketAddr, data: &[u8]) -> bool {
        let Ok(socket) = self.socket_handle() else {
            return false;
        };
        let server = self.clone();
        let owned = data.to_vec();
        self.inner.service.spawn(async move {
            match socket.send_to(&owned, peer).await {
                Ok(sent) => server.record_sent(peer, sent),
                Err(e) => {
                    warn!(server = %server.inner.id, %peer, "send failed: {e}");
                    server.inner.handler.lock().clone().on_error(&Error::Io(e));
                }
            }
        })
    }

    /// Send one datagram to the recorded multicast target.
    pub fn multicast(&self, data: &[u8]) -> bool {
        match *self.inner.multicast_target.lock() {
            Some(target) => self.send_async(target, data),
            None => false,
        }
    }

    fn record_sent(&self, peer: SocketAddr, size: usize) {
        self.inner
            .stats
            .bytes_sent
            .fetch_add(size as u64, Ordering::Relaxed);
        self.inner
            .stats
            .datagrams_sent
            .fetch_add(1, Ordering::Relaxed);
        if let Some(events) = self.inner.events.lock().clone() {
            let _ = events.send(Event::Sent { peer, size });
        }
    }

    fn socket_handle(&self) -> Result<Arc<UdpSocket>> {
        self.inner
            .socket
            .lock()
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// The driver: receive chain plus send-completion dispatch.
    async fn receive_loop(
        &self,
        socket: Arc<UdpSocket>,
        handler: Arc<dyn UdpServerHandler>,
        mut events: mpsc::UnboundedReceiver<Event>,
        token: CancellationToken,
    ) {
        let limit = self.options().receive_buffer_limit;
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            // Grow by one chunk, receive, shrink to the datagram size.
            buffer.resize(buffer.len() + RECEIVE_CHUNK, 0);
            if let Some(limit) = limit {
                if buffer.len() > limit {
                    handler.on_error(&Error::ReceiveBufferLimit { limit });
                    self.stop();
                    break;
                }
            }
            tokio::select! {
                () = token.cancelled() => break,
                event = events.recv() => {
                    buffer.clear();
                    match event {
                        Some(Event::Sent { peer, size }) => {
                            handler.on_sent(self, peer, size).await;
                        }
                        None => break,
                    }
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((size, peer)) => {
                        buffer.truncate(size);
                        self.inner
                            .stats
                            .bytes_received
                            .fetch_add(size as u64, Ordering::Relaxed);
                        self.inner
                            .stats
                            .datagrams_received
                            .fetch_add(1, Ordering::Relaxed);
                        handler.on_received(self, peer, &buffer).await;
                        buffer.clear();
                    }
                    Err(e) => {
                        buffer.clear();
                        if token.is_cancelled() {
                            break;
                        }
                        warn!(server = %self.inner.id, "receive failed: {e}");
                        handler.on_error(&Error::Io(e));
                    }
                },
            }
        }
        debug!(server = %self.inner.id, "UDP receive chain closed");
        let handler = self.inner.handler.lock().clone();
        handler.on_stopped(self).await;
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("started", &self.is_started())
            .finish()
    }
}
