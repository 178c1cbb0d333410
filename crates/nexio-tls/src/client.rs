//! TLS client: TCP connect followed by an async handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nexio_core::{
    AtomicEndpointState, DnsResolver, EndpointId, EndpointOptions, EndpointState, EndpointStats,
    Enqueue, Error, ReceiveBuffer, Resolver, Result, SendQueue, Service, StatsSnapshot, WireEvent,
    is_benign_tls_disconnect,
};
use nexio_tcp::sockopt;

use crate::context::TlsContext;

/// How long `reconnect` waits for the previous connection to tear down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification hooks for a [`TlsClient`].
#[async_trait]
pub trait TlsClientHandler: Send + Sync + 'static {
    /// The transport connection is established; the handshake follows.
    async fn on_connected(&self, _client: &TlsClient) {}
    /// The TLS handshake completed.
    async fn on_handshaked(&self, _client: &TlsClient) {}
    /// The client disconnected.
    async fn on_disconnected(&self, _client: &TlsClient) {}
    /// Another chunk of decrypted data arrived; return the consumed prefix.
    async fn on_received(&self, _client: &TlsClient, buffer: &[u8]) -> usize {
        buffer.len()
    }
    /// Another chunk of the send queue reached the OS.
    async fn on_sent(&self, _client: &TlsClient, _sent: usize, _pending: usize) {}
    /// The send queue is fully drained.
    async fn on_empty(&self, _client: &TlsClient) {}
    /// A non-benign transport or handshake error occurred.
    fn on_error(&self, _client: &TlsClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullTlsClientHandler;

impl TlsClientHandler for NullTlsClientHandler {}

enum Target {
    Endpoint(SocketAddr),
    Host {
        host: String,
        port: u16,
        resolver: Arc<dyn Resolver>,
    },
}

/// One connection epoch.
struct Link {
    queue: Arc<SendQueue>,
    shutdown: CancellationToken,
}

struct ClientInner {
    id: EndpointId,
    service: Service,
    context: TlsContext,
    target: Target,
    server_name: Mutex<Option<String>>,
    options: Mutex<EndpointOptions>,
    handler: Mutex<Arc<dyn TlsClientHandler>>,
    state: AtomicEndpointState,
    stats: EndpointStats,
    link: Mutex<Option<Arc<Link>>>,
    peer: Mutex<Option<SocketAddr>>,
    local: Mutex<Option<SocketAddr>>,
    drained: Notify,
    teardown: Notify,
}

/// TLS client endpoint. Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct TlsClient {
    inner: Arc<ClientInner>,
}

impl TlsClient {
    /// Create a client targeting a known endpoint. Fails fast when the
    /// context carries no client configuration.
    pub fn new(service: &Service, endpoint: SocketAddr, context: &TlsContext) -> Result<Self> {
        context.connector()?;
        Ok(Self::build(service, Target::Endpoint(endpoint), context))
    }

    /// Create a client resolving `host:port`; the host doubles as the SNI
    /// name. Fails fast when the context carries no client configuration.
    pub fn with_host(
        service: &Service,
        host: impl Into<String>,
        port: u16,
        context: &TlsContext,
    ) -> Result<Self> {
        context.connector()?;
        Ok(Self::build(
            service,
            Target::Host {
                host: host.into(),
                port,
                resolver: Arc::new(DnsResolver),
            },
            context,
        ))
    }

    fn build(service: &Service, target: Target, context: &TlsContext) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: EndpointId::generate(),
                service: service.clone(),
                context: context.clone(),
                target,
                server_name: Mutex::new(None),
                options: Mutex::new(EndpointOptions::default()),
                handler: Mutex::new(Arc::new(NullTlsClientHandler)),
                state: AtomicEndpointState::default(),
                stats: EndpointStats::new(),
                link: Mutex::new(None),
                peer: Mutex::new(None),
                local: Mutex::new(None),
                drained: Notify::new(),
                teardown: Notify::new(),
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

    /// Install the client handler. Takes effect on the next connect.
    pub fn set_handler(&self, handler: Arc<dyn TlsClientHandler>) {
        *self.inner.handler.lock() = handler;
    }

    /// Replace the endpoint options applied on connect.
    pub fn set_options(&self, options: EndpointOptions) {
        *self.inner.options.lock() = options;
    }

    /// Override the SNI name presented during the handshake. Defaults to
    /// the target host, or the endpoint's IP address.
    pub fn set_server_name(&self, name: impl Into<String>) {
        *self.inner.server_name.lock() = Some(name.into());
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

    /// Remote peer address while connected.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        *self.inner.peer.lock()
    }

    /// Local socket address while connected.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.inner.local.lock()
    }

    /// Transfer statistics for the current connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Connect and handshake synchronously. Reads are not auto-started;
    /// call [`receive_async`](Self::receive_async). Must be called from
    /// outside the service's worker threads.
    pub fn connect(&self) -> Result<()> {
        let client = self.clone();
        self.inner
            .service
            .block_on(async move { client.connect_impl(false).await })?
    }

    /// Connect asynchronously; the handshake chains onto the connect and
    /// the receive chain auto-starts. Failures are reported via `on_error`.
    pub fn connect_async(&self) -> bool {
        if self.state() != EndpointState::Disconnected {
            return false;
        }
        let client = self.clone();
        self.inner.service.spawn(async move {
            if let Err(e) = client.connect_impl(true).await {
                warn!(client = %client.inner.id, "connect failed: {e}");
                client.inner.handler.lock().clone().on_error(&client, &e);
            }
        })
    }

    /// Disconnect and block until the teardown completes.
    pub fn disconnect(&self) -> Result<()> {
        if !self.disconnect_async() {
            return Err(Error::NotConnected);
        }
        self.wait_teardown(TEARDOWN_TIMEOUT)
    }

    /// Request a disconnect; teardown happens on the driver task.
    pub fn disconnect_async(&self) -> bool {
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
        if let Some(link) = self.inner.link.lock().clone() {
            link.shutdown.cancel();
        }
        true
    }

    /// Disconnect, wait for the previous connection to fully tear down,
    /// then connect again.
    pub fn reconnect(&self) -> Result<()> {
        if self.is_connected() {
            self.disconnect()?;
        }
        self.connect()
    }

    /// Append data to the send queue; the reactor encrypts and drains it
    /// asynchronously. Requires a completed handshake.
    pub fn send_async(&self, data: &[u8]) -> bool {
        if !self.is_handshaked() {
            return false;
        }
        let Some(link) = self.inner.link.lock().clone() else {
            return false;
        };
        match link.queue.enqueue(data, &self.inner.stats) {
            Enqueue::Queued { .. } | Enqueue::InFlight { .. } => true,
            Enqueue::LimitExceeded { pending, limit } => {
                warn!(
                    client = %self.inner.id,
                    pending, limit, "send buffer limit exceeded; disconnecting"
                );
                self.disconnect_async();
                false
            }
            Enqueue::Closed => false,
        }
    }

    /// Send data and block until the queue fully drains.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_with_deadline(data, None)
    }

    /// As [`send`](Self::send) with a bound on the blocking time.
    pub fn send_timeout(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.send_with_deadline(data, Some(timeout))
    }

    /// Start the receive chain delivering to `on_received`. A TLS endpoint
    /// reads as soon as the handshake completes (the record layer must keep
    /// consuming close_notify and rekey traffic), so this only reports
    /// whether receiving is active.
    pub fn receive_async(&self) -> bool {
        self.is_handshaked()
    }

    fn send_with_deadline(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.send_async(data) {
            return Err(Error::NotConnected);
        }
        let inner = Arc::clone(&self.inner);
        let wait = async move {
            loop {
                let idle = match inner.link.lock().clone() {
                    Some(link) => link.queue.is_idle() || link.queue.is_closed(),
                    None => true,
                };
                if idle {
                    return;
                }
                inner.drained.notified().await;
            }
        };
        self.inner.service.block_on(async move {
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

    fn wait_teardown(&self, timeout: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.service.block_on(async move {
            tokio::time::timeout(timeout, async {
                while inner.state.load() != EndpointState::Disconnected {
                    inner.teardown.notified().await;
                }
            })
            .await
            .map_err(|_| Error::Timeout)
        })?
    }

    fn sni_name(&self) -> Result<ServerName<'static>> {
        let name = match self.inner.server_name.lock().clone() {
            Some(name) => name,
            None => match &self.inner.target {
                Target::Host { host, .. } => host.clone(),
                Target::Endpoint(addr) => addr.ip().to_string(),
            },
        };
        ServerName::try_from(name)
            .map_err(|e| Error::Configuration(format!("invalid TLS server name: {e}")))
    }

    async fn connect_impl(&self, _auto_receive: bool) -> Result<()> {
        let inner = &self.inner;
        if !inner
            .state
            .transition(EndpointState::Disconnected, EndpointState::Connecting)
        {
            return Err(Error::Configuration("client is already connected".into()));
        }

        let result = self.establish().await;
        let tls = match result {
            Ok(tls) => tls,
            Err(e) => {
                inner.state.store(EndpointState::Disconnected);
                inner.teardown.notify_one();
                return Err(e);
            }
        };
        let (stream, receive_capacity, send_capacity) = tls;

        inner.stats.reset();
        *inner.peer.lock() = stream.get_ref().0.peer_addr().ok();
        *inner.local.lock() = stream.get_ref().0.local_addr().ok();

        // A disconnect may have raced the handshake.
        if !inner
            .state
            .transition(EndpointState::Handshaking, EndpointState::Handshaked)
        {
            inner.state.store(EndpointState::Disconnected);
            inner.teardown.notify_one();
            return Err(Error::ConnectionFailed("connect was cancelled".into()));
        }

        let options = inner.options.lock().clone();
        let queue = Arc::new(SendQueue::new(options.send_buffer_limit));
        queue.reserve(send_capacity);
        let link = Arc::new(Link {
            queue,
            shutdown: CancellationToken::new(),
        });
        *inner.link.lock() = Some(Arc::clone(&link));
        debug!(client = %inner.id, peer = ?inner.peer.lock(), "client handshaked");

        let handler = inner.handler.lock().clone();
        handler.on_handshaked(self).await;

        let client = self.clone();
        inner
            .service
            .spawn(client.run(stream, handler, link, receive_capacity));
        Ok(())
    }

    /// TCP connect, socket options, `on_connected`, then the handshake.
    async fn establish(&self) -> Result<(TlsStream<TcpStream>, usize, usize)> {
        let inner = &self.inner;
        let addresses = match &inner.target {
            Target::Endpoint(addr) => vec![*addr],
            Target::Host {
                host,
                port,
                resolver,
            } => resolver.resolve(host, *port).await?,
        };

        let mut last_error: Option<Error> = None;
        let mut connected: Option<(TcpStream, usize, usize)> = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let options = inner.options.lock().clone();
                    let sizes = sockopt::apply_stream_options(&stream, &options)?;
                    connected = Some((stream, sizes.0, sizes.1));
                    break;
                }
                Err(e) => last_error = Some(e.into()),
            }
        }
        let Some((stream, receive_capacity, send_capacity)) = connected else {
            return Err(last_error
                .unwrap_or_else(|| Error::ConnectionFailed("no endpoint to connect to".into())));
        };

        let connector = inner.context.connector()?;
        let name = self.sni_name()?;

        if !inner
            .state
            .transition(EndpointState::Connecting, EndpointState::Connected)
        {
            return Err(Error::ConnectionFailed("connect was cancelled".into()));
        }
        let handler = inner.handler.lock().clone();
        handler.on_connected(self).await;

        inner.state.store(EndpointState::Handshaking);
        let tls = match connector.connect(name, stream).await {
            Ok(tls) => tls,
            Err(e) => {
                // The connected notification already went out; pair it.
                handler.on_disconnected(self).await;
                return Err(Error::HandshakeFailed(e.to_string()));
            }
        };
        Ok((tls, receive_capacity, send_capacity))
    }

    /// The driver task: every handler invocation for this client runs here.
    async fn run(
        self,
        stream: TlsStream<TcpStream>,
        handler: Arc<dyn TlsClientHandler>,
        link: Arc<Link>,
        receive_capacity: usize,
    ) {
        let inner = &self.inner;
        let (mut read_half, mut write_half): (ReadHalf<_>, _) = tokio::io::split(stream);
        let options = inner.options.lock().clone();
        let mut receive_buffer = ReceiveBuffer::new(receive_capacity, options.receive_buffer_limit);

        let (wire_tx, mut wire) = mpsc::unbounded_channel();
        let writer = {
            let queue = Arc::clone(&link.queue);
            let owner = self.clone();
            tokio::spawn(async move {
                match queue
                    .drain(&mut write_half, &owner.inner.stats, &wire_tx)
                    .await
                {
                    Ok(()) => {
                        let _ = write_half.shutdown().await;
                    }
                    Err(e) => {
                        let _ = wire_tx.send(WireEvent::WriteError(e));
                    }
                }
            })
        };

        let mut error: Option<Error> = None;
        loop {
            tokio::select! {
                () = link.shutdown.cancelled() => break,
                event = wire.recv() => match event {
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

        inner.state.store(EndpointState::Disconnecting);
        link.queue.close(&inner.stats);
        link.shutdown.cancel();
        writer.abort();
        let _ = writer.await;
        drop(read_half);

        if let Some(error) = &error {
            handler.on_error(&self, error);
        }

        *inner.link.lock() = None;
        *inner.peer.lock() = None;
        *inner.local.lock() = None;
        inner.state.store(EndpointState::Disconnected);
        inner.drained.notify_one();
        debug!(client = %inner.id, "client disconnected");
        handler.on_disconnected(&self).await;
        inner.teardown.notify_one();
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
