//! UDP client: a connected datagram endpoint with multicast group
//! membership.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nexio_core::{
    AtomicEndpointState, EndpointId, EndpointOptions, EndpointState, EndpointStats, Error, Result,
    Service, StatsSnapshot,
};

use crate::server::RECEIVE_CHUNK;
use crate::socket;

/// Notification hooks for a [`UdpClient`].
#[async_trait]
pub trait UdpClientHandler: Send + Sync + 'static {
    /// The socket is open.
    async fn on_connected(&self, _client: &UdpClient) {}
    /// The socket closed.
    async fn on_disconnected(&self, _client: &UdpClient) {}
    /// A datagram arrived from `peer`.
    async fn on_received(&self, _client: &UdpClient, _peer: SocketAddr, _data: &[u8]) {}
    /// A datagram to `peer` was handed to the OS.
    async fn on_sent(&self, _client: &UdpClient, _peer: SocketAddr, _size: usize) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _client: &UdpClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullUdpClientHandler;

impl UdpClientHandler for NullUdpClientHandler {}

enum Event {
    Sent { peer: SocketAddr, size: usize },
    StartReceive,
}

struct ClientInner {
    id: EndpointId,
    service: Service,
    remote: SocketAddr,
    options: Mutex<EndpointOptions>,
    handler: Mutex<Arc<dyn UdpClientHandler>>,
    state: AtomicEndpointState,
    stats: EndpointStats,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stop: Mutex<Option<CancellationToken>>,
}

/// UDP client endpoint targeting one remote endpoint (or multicast group).
/// Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct UdpClient {
    inner: Arc<ClientInner>,
}

impl UdpClient {
    /// Create a client targeting `remote`.
    #[must_use]
    pub fn new(service: &Service, remote: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: EndpointId::generate(),
                service: service.clone(),
                remote,
                options: Mutex::new(EndpointOptions::default()),
                handler: Mutex::new(Arc::new(NullUdpClientHandler)),
                state: AtomicEndpointState::default(),
                stats: EndpointStats::new(),
                socket: Mutex::new(None),
                events: Mutex::new(None),
                stop: Mutex::new(None),
            }),
        }
    }

    /// The client identifier.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// The reactor service this client is bound to.
    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// The remote endpoint datagrams go to by default.
    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote
    }

    /// The local bound address while connected.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner
            .socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Install the client handler. Takes effect on the next connect.
    pub fn set_handler(&self, handler: Arc<dyn UdpClientHandler>) {
        *self.inner.handler.lock() = handler;
    }

    /// Replace the endpoint options applied on connect.
    pub fn set_options(&self, options: EndpointOptions) {
        *self.inner.options.lock() = options;
    }

    /// Current endpoint options.
    pub fn options(&self) -> EndpointOptions {
        self.inner.options.lock().clone()
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.load() == EndpointState::Connected
    }

    /// Transfer statistics for the current connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Open the socket synchronously. Reads are not auto-started; call
    /// [`receive_async`](Self::receive_async).
    pub fn connect(&self) -> Result<()> {
        self.connect_impl(false)
    }

    /// Open the socket; the receive chain auto-starts.
    pub fn connect_async(&self) -> bool {
        self.connect_impl(true).is_ok()
    }

    fn connect_impl(&self, auto_receive: bool) -> Result<()> {
        let inner = &self.inner;
        if !inner
            .state
            .transition(EndpointState::Disconnected, EndpointState::Connecting)
        {
            return Err(Error::Configuration("client is already connected".into()));
        }

        let options = inner.options.lock().clone();
        let unspecified = match inner.remote {
            SocketAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        // A multicast participant shares the group port; a unicast client
        // takes any free local port.
        let port = if options.multicast {
            inner.remote.port()
        } else {
            0
        };
        let bind = SocketAddr::new(unspecified, port);

        let opened = inner
            .service
            .handle()
            .and_then(|handle| socket::build_socket(bind, &options, &handle).map_err(Error::Io));
        let socket = match opened {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                inner.state.store(EndpointState::Disconnected);
                return Err(e);
            }
        };

        inner.stats.reset();
        *inner.socket.lock() = Some(Arc::clone(&socket));
        let token = CancellationToken::new();
        *inner.stop.lock() = Some(token.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if auto_receive {
            let _ = events_tx.send(Event::StartReceive);
        }
        *inner.events.lock() = Some(events_tx);
        inner.state.store(EndpointState::Connected);
        info!(client = %inner.id, remote = %inner.remote, "UDP client connected");

        let client = self.clone();
        inner.service.spawn(async move {
            let handler = client.inner.handler.lock().clone();
            handler.on_connected(&client).await;
            client.drive(socket, handler, events_rx, token).await;
        });
        Ok(())
    }

    /// Close the socket.
    pub fn disconnect(&self) -> bool {
        if !self
            .inner
            .state
            .transition(EndpointState::Connected, EndpointState::Disconnecting)
        {
            return false;
        }
        if let Some(token) = self.inner.stop.lock().take() {
            token.cancel();
        }
        *self.inner.socket.lock() = None;
        *self.inner.events.lock() = None;
        true
    }

    /// Join a multicast group on this socket. The async variant only
    /// differs by dispatching onto the reactor.
    pub fn join_multicast_group(&self, group: IpAddr) -> Result<()> {
        let socket = self.socket_handle()?;
        match group {
            IpAddr::V4(group) => {
                socket.join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED)?;
            }
            IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
        }
        debug!(client = %self.inner.id, %group, "joined multicast group");
        Ok(())
    }

    /// As [`join_multicast_group`](Self::join_multicast_group), dispatched
    /// onto the reactor.
    pub fn join_multicast_group_async(&self, group: IpAddr) -> bool {
        let client = self.clone();
        self.inner.service.dispatch(move || {
            if let Err(e) = client.join_multicast_group(group) {
                client.inner.handler.lock().clone().on_error(&client, &e);
            }
        })
    }

    /// Leave a multicast group on this socket.
    pub fn leave_multicast_group(&self, group: IpAddr) -> Result<()> {
        let socket = self.socket_handle()?;
        match group {
            IpAddr::V4(group) => {
                socket.leave_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED)?;
            }
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0)?,
        }
        debug!(client = %self.inner.id, %group, "left multicast group");
        Ok(())
    }

    /// As [`leave_multicast_group`](Self::leave_multicast_group),
    /// dispatched onto the reactor.
    pub fn leave_multicast_group_async(&self, group: IpAddr) -> bool {
        let client = self.clone();
        self.inner.service.dispatch(move || {
            if let Err(e) = client.leave_multicast_group(group) {
                client.inner.handler.lock().clone().on_error(&client, &e);
            }
        })
    }

    /// Send one datagram to the default remote endpoint synchronously.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_to(self.inner.remote, data)
    }

    /// Send one datagram to `peer` synchronously. Must be called from
    /// outside the service's worker threads.
    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result<usize> {
        let socket = self.socket_handle()?;
        let owned = data.to_vec();
        let sent = self
            .inner
            .service
            .block_on(async move { socket.send_to(&owned, peer).await })??;
        self.record_sent(peer, sent);
        Ok(sent)
    }

    /// Post one datagram to the default remote endpoint.
    pub fn send_async(&self, data: &[u8]) -> bool {
        self.send_to_async(self.inner.remote, data)
    }

    /// Post one datagram to `peer`; the completion is reported through
    /// `on_sent`.
    pub fn send_to_async(&self, peer: SocketAddr, data: &[u8]) -> bool {
        let Ok(socket) = self.socket_handle() else {
            return false;
        };
        let client = self.clone();
        let owned = data.to_vec();
        self.inner.service.spawn(async move {
            match socket.send_to(&owned, peer).await {
                Ok(sent) => client.record_sent(peer, sent),
                Err(e) => {
                    warn!(client = %client.inner.id, %peer, "send failed: {e}");
                    client
                        .inner
                        .handler
                        .lock()
                        .clone()
                        .on_error(&client, &Error::Io(e));
                }
            }
        })
    }

    /// Start the receive chain delivering to `on_received`.
    pub fn receive_async(&self) -> bool {
        match self.inner.events.lock().clone() {
            Some(events) => events.send(Event::StartReceive).is_ok(),
            None => false,
        }
    }

    fn record_sent(&self, peer: SocketAddr, size: usize) {
        self.inner
            .stats
            .bytes_sent
            .fetch_add(size as u64, std::sync::atomic::Ordering::Relaxed);
        self.inner
            .stats
            .datagrams_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
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
    async fn drive(
        &self,
        socket: Arc<UdpSocket>,
        handler: Arc<dyn UdpClientHandler>,
        mut events: mpsc::UnboundedReceiver<Event>,
        token: CancellationToken,
    ) {
        let limit = self.options().receive_buffer_limit;
        let mut buffer: Vec<u8> = Vec::new();
        let mut reading = false;
        loop {
            buffer.clear();
            if reading {
                buffer.resize(RECEIVE_CHUNK, 0);
                if let Some(limit) = limit {
                    if buffer.len() > limit {
                        handler.on_error(self, &Error::ReceiveBufferLimit { limit });
                        self.disconnect();
                        break;
                    }
                }
            }
            tokio::select! {
                () = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(Event::Sent { peer, size }) => {
                        handler.on_sent(self, peer, size).await;
                    }
                    Some(Event::StartReceive) => reading = true,
                    None => break,
                },
                received = socket.recv_from(&mut buffer), if reading => match received {
                    Ok((size, peer)) => {
                        buffer.truncate(size);
                        self.inner
                            .stats
                            .bytes_received
                            .fetch_add(size as u64, std::sync::atomic::Ordering::Relaxed);
                        self.inner
                            .stats
                            .datagrams_received
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        handler.on_received(self, peer, &buffer).await;
                    }
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        warn!(client = %self.inner.id, "receive failed: {e}");
                        handler.on_error(self, &Error::Io(e));
                    }
                },
            }
        }
        self.inner.state.store(EndpointState::Disconnected);
        debug!(client = %self.inner.id, "UDP client disconnected");
        handler.on_disconnected(self).await;
    }
}

impl std::fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpClient")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.inner.state.load())
            .finish()
    }
}
