//! TCP client with an explicit (re)connect life-cycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nexio_core::{
    AtomicEndpointState, DnsResolver, EndpointId, EndpointOptions, EndpointState, EndpointStats,
    Enqueue, Error, HandlerStorage, ReceiveBuffer, Resolver, Result, SendQueue, Service,
    StatsSnapshot, WireEvent, is_benign_disconnect,
};

use crate::sockopt;

/// How long `reconnect` waits for the previous connection to tear down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification hooks for a [`TcpClient`].
#[async_trait]
pub trait TcpClientHandler: Send + Sync + 'static {
    /// The client connected.
    async fn on_connected(&self, _client: &TcpClient) {}
    /// The client disconnected.
    async fn on_disconnected(&self, _client: &TcpClient) {}
    /// Another chunk of data arrived; return the consumed prefix length.
    async fn on_received(&self, _client: &TcpClient, buffer: &[u8]) -> usize {
        buffer.len()
    }
    /// Another chunk of the send queue reached the OS.
    async fn on_sent(&self, _client: &TcpClient, _sent: usize, _pending: usize) {}
    /// The send queue is fully drained.
    async fn on_empty(&self, _client: &TcpClient) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _client: &TcpClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullClientHandler;

impl TcpClientHandler for NullClientHandler {}

/// Where the client connects to.
enum Target {
    /// A directly bound or pre-resolved endpoint.
    Endpoint(SocketAddr),
    /// Resolve through the DNS oracle on every connect.
    Host {
        host: String,
        port: u16,
        resolver: Arc<dyn Resolver>,
    },
}

/// Control messages consumed by the client's driver task.
enum Control {
    /// Begin the perpetual receive chain.
    StartReceive,
    /// Perform one bounded read, bypassing the handler.
    ReceiveOnce {
        max: usize,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// One connection epoch.
struct Link {
    queue: Arc<SendQueue>,
    control: mpsc::UnboundedSender<Control>,
    shutdown: CancellationToken,
}

struct ClientInner {
    id: EndpointId,
    service: Service,
    target: Target,
    options: Mutex<EndpointOptions>,
    handler: Mutex<Arc<dyn TcpClientHandler>>,
    state: AtomicEndpointState,
    stats: EndpointStats,
    link: Mutex<Option<Arc<Link>>>,
    peer: Mutex<Option<SocketAddr>>,
    local: Mutex<Option<SocketAddr>>,
    drained: Notify,
    teardown: Notify,
}

/// TCP client endpoint. Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    /// Create a client targeting a known endpoint.
    #[must_use]
    pub fn new(service: &Service, endpoint: SocketAddr) -> Self {
        Self::build(service, Target::Endpoint(endpoint))
    }

    /// Create a client resolving `host:port` through the system resolver.
    #[must_use]
    pub fn with_host(service: &Service, host: impl Into<String>, port: u16) -> Self {
        Self::with_resolver(service, host, port, Arc::new(DnsResolver))
    }

    /// Create a client resolving `host:port` through the given resolver.
    #[must_use]
    pub fn with_resolver(
        service: &Service,
        host: impl Into<String>,
        port: u16,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self::build(
            service,
            Target::Host {
                host: host.into(),
                port,
                resolver,
            },
        )
    }

    fn build(service: &Service, target: Target) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: EndpointId::generate(),
                service: service.clone(),
                target,
                options: Mutex::new(EndpointOptions::default()),
                handler: Mutex::new(Arc::new(NullClientHandler)),
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
    pub fn set_handler(&self, handler: Arc<dyn TcpClientHandler>) {
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

    /// Current life-cycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.state.load()
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            EndpointState::Connected | EndpointState::Handshaking | EndpointState::Handshaked
        )
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

    /// Connect synchronously. Reads are not auto-started; call
    /// [`receive`](Self::receive) or [`receive_async`](Self::receive_async).
    /// Must be called from outside the service's worker threads.
    pub fn connect(&self) -> Result<()> {
        let client = self.clone();
        self.inner
            .service
            .block_on(async move { client.connect_impl(false).await })?
    }

    /// Connect asynchronously; the receive chain auto-starts on success.
    /// Failures are reported through `on_error`.
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

    /// As [`reconnect`](Self::reconnect), scheduled on the service.
    pub fn reconnect_async(&self) -> bool {
        let client = self.clone();
        self.inner.service.spawn(async move {
            if client.is_connected() {
                client.disconnect_async();
                let torn_down = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
                    while client.state() != EndpointState::Disconnected {
                        client.inner.teardown.notified().await;
                    }
                })
                .await;
                if torn_down.is_err() {
                    warn!(client = %client.inner.id, "reconnect: teardown timed out");
                    return;
                }
            }
            if let Err(e) = client.connect_impl(true).await {
                client.inner.handler.lock().clone().on_error(&client, &e);
            }
        })
    }

    /// Append data to the send queue; the reactor drains it asynchronously.
    pub fn send_async(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
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

    /// Perform one bounded read of up to `max` bytes, bypassing the
    /// handler. Returns an empty buffer when the timeout expires first.
    pub fn receive(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let link = self.inner.link.lock().clone().ok_or(Error::NotConnected)?;
        let (reply, response) = oneshot::channel();
        link.control
            .send(Control::ReceiveOnce {
                max,
                timeout,
                reply,
            })
            .map_err(|_| Error::NotConnected)?;
        self.inner
            .service
            .block_on(response)?
            .map_err(|_| Error::NotConnected)?
    }

    /// Start the perpetual receive chain delivering to `on_received`.
    pub fn receive_async(&self) -> bool {
        match self.inner.link.lock().clone() {
            Some(link) => link.control.send(Control::StartReceive).is_ok(),
            None => false,
        }
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

    async fn connect_impl(&self, auto_receive: bool) -> Result<()> {
        let inner = &self.inner;
        if !inner
            .state
            .transition(EndpointState::Disconnected, EndpointState::Connecting)
        {
            return Err(Error::Configuration("client is already connected".into()));
        }

        let (stream, receive_capacity, send_capacity) = match self.establish().await {
            Ok(connected) => connected,
            Err(e) => {
                inner.state.store(EndpointState::Disconnected);
                inner.teardown.notify_one();
                return Err(e);
            }
        };

        // A disconnect may have raced the establishment.
        if !inner
            .state
            .transition(EndpointState::Connecting, EndpointState::Connected)
        {
            inner.state.store(EndpointState::Disconnected);
            inner.teardown.notify_one();
            return Err(Error::ConnectionFailed("connect was cancelled".into()));
        }

        inner.stats.reset();
        *inner.peer.lock() = stream.peer_addr().ok();
        *inner.local.lock() = stream.local_addr().ok();

        let options = inner.options.lock().clone();
        let queue = Arc::new(SendQueue::new(options.send_buffer_limit));
        queue.reserve(send_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            queue,
            control: control_tx.clone(),
            shutdown: CancellationToken::new(),
        });
        *inner.link.lock() = Some(Arc::clone(&link));
        debug!(client = %inner.id, peer = ?inner.peer.lock(), "client connected");

        let handler = inner.handler.lock().clone();
        handler.on_connected(self).await;

        if auto_receive {
            let _ = control_tx.send(Control::StartReceive);
        }

        let client = self.clone();
        inner
            .service
            .spawn(client.run(stream, handler, link, control_rx, receive_capacity));
        Ok(())
    }

    async fn establish(&self) -> Result<(TcpStream, usize, usize)> {
        let addresses = match &self.inner.target {
            Target::Endpoint(addr) => vec![*addr],
            Target::Host {
                host,
                port,
                resolver,
            } => resolver.resolve(host, *port).await?,
        };

        let mut last_error: Option<Error> = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let options = self.inner.options.lock().clone();
                    let (receive, send) = sockopt::apply_stream_options(&stream, &options)?;
                    return Ok((stream, receive, send));
                }
                Err(e) => last_error = Some(e.into()),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::ConnectionFailed("no endpoint to connect to".into())))
    }

    /// The driver task: every handler invocation for this client runs here.
    async fn run(
        self,
        stream: TcpStream,
        handler: Arc<dyn TcpClientHandler>,
        link: Arc<Link>,
        mut control: mpsc::UnboundedReceiver<Control>,
        receive_capacity: usize,
    ) {
        let inner = &self.inner;
        let (mut read_half, mut write_half) = stream.into_split();
        let options = inner.options.lock().clone();
        let mut receive_buffer = ReceiveBuffer::new(receive_capacity, options.receive_buffer_limit);
        let mut reading = false;
        // Scratch block for one-shot receive completions.
        let storage = HandlerStorage::new();

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
                        if !is_benign_disconnect(&e) {
                            error = Some(e.into());
                        }
                        break;
                    }
                    None => break,
                },
                command = control.recv() => match command {
                    Some(Control::StartReceive) => reading = true,
                    Some(Control::ReceiveOnce { max, timeout, reply }) => {
                        let mut chunk = storage.allocate(max.max(1));
                        let read = read_half.read(&mut chunk);
                        let outcome = match timeout {
                            Some(timeout) => tokio::time::timeout(timeout, read)
                                .await
                                .unwrap_or(Ok(0)),
                            None => read.await,
                        };
                        match outcome {
                            Ok(received) => {
                                inner.stats.bytes_received.fetch_add(
                                    received as u64,
                                    std::sync::atomic::Ordering::Relaxed,
                                );
                                let _ = reply.send(Ok(chunk[..received].to_vec()));
                                storage.deallocate(chunk);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e.into()));
                                storage.deallocate(chunk);
                                break;
                            }
                        }
                    }
                    None => break,
                },
                received = receive_buffer.read_from(&mut read_half, &inner.stats), if reading => {
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

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
