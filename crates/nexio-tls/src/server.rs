//! TLS server: a TCP acceptor whose sessions handshake before use.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nexio_core::{
    EndpointId, EndpointOptions, EndpointStats, Error, Result, Service, StatsSnapshot,
};
use nexio_tcp::sockopt;

use crate::context::TlsContext;
use crate::session::{NullTlsSessionHandler, TlsSession, TlsSessionHandler};

/// How long `restart` waits for the previous epoch's sessions to unwind.
const RESTART_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification hooks for a [`TlsServer`].
#[async_trait]
pub trait TlsServerHandler: Send + Sync + 'static {
    /// Produce the handler driving one accepted session.
    fn create_session(&self, _session: &TlsSession) -> Arc<dyn TlsSessionHandler> {
        Arc::new(NullTlsSessionHandler)
    }
    /// The acceptor is listening.
    async fn on_started(&self, _server: &TlsServer) {}
    /// The acceptor closed and all sessions were told to disconnect.
    async fn on_stopped(&self, _server: &TlsServer) {}
    /// A session connected (pre-handshake) and was registered.
    async fn on_connected(&self, _session: &TlsSession) {}
    /// A session completed its TLS handshake.
    async fn on_handshaked(&self, _session: &TlsSession) {}
    /// A session disconnected and is about to be unregistered.
    async fn on_disconnected(&self, _session: &TlsSession) {}
    /// A non-benign transport or handshake error occurred.
    fn on_error(&self, _error: &Error) {}
}

/// No-op server hooks.
#[derive(Debug, Default)]
pub struct NullTlsServerHandler;

impl TlsServerHandler for NullTlsServerHandler {}

pub(crate) struct TlsServerShared {
    pub(crate) id: EndpointId,
    pub(crate) service: Service,
    pub(crate) acceptor: TlsAcceptor,
    address: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    options: Mutex<EndpointOptions>,
    handler: Mutex<Arc<dyn TlsServerHandler>>,
    sessions: RwLock<HashMap<EndpointId, TlsSession>>,
    departed: EndpointStats,
    started: AtomicBool,
    listener_stop: Mutex<Option<CancellationToken>>,
}

impl TlsServerShared {
    pub(crate) fn handler(&self) -> Arc<dyn TlsServerHandler> {
        Arc::clone(&self.handler.lock())
    }

    pub(crate) fn unregister(&self, id: EndpointId, stats: &EndpointStats) {
        let snapshot = stats.snapshot();
        self.departed
            .bytes_sent
            .fetch_add(snapshot.bytes_sent, Ordering::Relaxed);
        self.departed
            .bytes_received
            .fetch_add(snapshot.bytes_received, Ordering::Relaxed);
        self.sessions.write().remove(&id);
    }
}

/// TLS server. The context is shared and immutable after `start`. Cloning
/// is cheap and shares the server.
#[derive(Clone)]
pub struct TlsServer {
    pub(crate) shared: Arc<TlsServerShared>,
}

impl TlsServer {
    /// Create a server bound to `address` once started. Fails fast when the
    /// context carries no server configuration.
    pub fn new(service: &Service, address: SocketAddr, context: &TlsContext) -> Result<Self> {
        let acceptor = context.acceptor()?;
        Ok(Self {
            shared: Arc::new(TlsServerShared {
                id: EndpointId::generate(),
                service: service.clone(),
                acceptor,
                address,
                bound: Mutex::new(None),
                options: Mutex::new(EndpointOptions::default()),
                handler: Mutex::new(Arc::new(NullTlsServerHandler)),
                sessions: RwLock::new(HashMap::new()),
                departed: EndpointStats::new(),
                started: AtomicBool::new(false),
                listener_stop: Mutex::new(None),
            }),
        })
    }

    /// The server identifier.
    pub fn id(&self) -> EndpointId {
        self.shared.id
    }

    /// The reactor service this server is bound to.
    pub fn service(&self) -> &Service {
        &self.shared.service
    }

    /// The configured bind address.
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    /// The actual bound address (resolves port 0), once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        *self.shared.bound.lock()
    }

    /// Install the server handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn TlsServerHandler>) {
        *self.shared.handler.lock() = handler;
    }

    /// Replace the endpoint options applied at `start` and on accept.
    pub fn set_options(&self, options: EndpointOptions) {
        *self.shared.options.lock() = options;
    }

    /// Current endpoint options.
    pub fn options(&self) -> EndpointOptions {
        self.shared.options.lock().clone()
    }

    /// Whether the acceptor is running.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Number of currently registered sessions.
    pub fn connected_sessions(&self) -> usize {
        self.shared.sessions.read().len()
    }

    /// Look a session up by identifier.
    pub fn find_session(&self, id: EndpointId) -> Option<TlsSession> {
        self.shared.sessions.read().get(&id).cloned()
    }

    /// Aggregate transfer statistics: live sessions plus departed ones.
    pub fn stats(&self) -> StatsSnapshot {
        let mut total = self.shared.departed.snapshot();
        for session in self.shared.sessions.read().values() {
            let snapshot = session.stats();
            total.bytes_sent += snapshot.bytes_sent;
            total.bytes_received += snapshot.bytes_received;
            total.bytes_pending += snapshot.bytes_pending;
            total.bytes_sending += snapshot.bytes_sending;
        }
        total
    }

    /// Open the acceptor, bind, listen and start the perpetual accept
    /// chain.
    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::Configuration("server is already started".into()));
        }
        let options = self.options();
        let handle = self.shared.service.handle()?;
        let listener = sockopt::build_listener(self.shared.address, &options, &handle)?;
        let bound = listener.local_addr()?;
        *self.shared.bound.lock() = Some(bound);

        let token = CancellationToken::new();
        *self.shared.listener_stop.lock() = Some(token.clone());
        self.shared.started.store(true, Ordering::Release);
        info!(server = %self.shared.id, %bound, "TLS server listening");

        let server = self.clone();
        self.shared.service.spawn(async move {
            server.shared.handler().on_started(&server).await;
            server.accept_loop(listener, token).await;
        });
        Ok(())
    }

    /// Close the acceptor and issue a disconnect to every registered
    /// session.
    pub fn stop(&self) -> bool {
        if !self.shared.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(token) = self.shared.listener_stop.lock().take() {
            token.cancel();
        }
        self.disconnect_all();
        *self.shared.bound.lock() = None;
        info!(server = %self.shared.id, "TLS server stopped");

        let server = self.clone();
        self.shared.service.spawn(async move {
            server.shared.handler().on_stopped(&server).await;
        });
        true
    }

    /// `stop`, wait for the session table to drain, then `start` again.
    pub fn restart(&self) -> Result<()> {
        if !self.stop() {
            return Err(Error::Configuration("server is not started".into()));
        }
        let deadline = Instant::now() + RESTART_DRAIN_TIMEOUT;
        while self.connected_sessions() > 0 {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.start()
    }

    /// Send data to every handshaked session. Iterates the table under the
    /// shared lock.
    pub fn multicast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.shared.sessions.read().values() {
            session.send_async(data);
        }
        true
    }

    /// Disconnect every registered session.
    pub fn disconnect_all(&self) -> bool {
        for session in self.shared.sessions.read().values() {
            session.disconnect();
        }
        true
    }

    async fn accept_loop(&self, listener: tokio::net::TcpListener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let options = self.options();
                    let (receive_capacity, send_capacity) =
                        match sockopt::apply_stream_options(&stream, &options) {
                            Ok(sizes) => sizes,
                            Err(e) => {
                                error!(%peer, "failed to apply socket options: {e}");
                                self.shared.handler().on_error(&Error::Io(e));
                                continue;
                            }
                        };
                    let local = stream.local_addr().unwrap_or(self.shared.address);

                    let session =
                        TlsSession::new(Arc::downgrade(&self.shared), options, peer, local);
                    self.shared
                        .sessions
                        .write()
                        .insert(session.id(), session.clone());

                    let handler = self.shared.handler().create_session(&session);
                    debug!(server = %self.shared.id, session = %session.id(), %peer, "session accepted");
                    self.shared.service.spawn(session.run(
                        stream,
                        handler,
                        receive_capacity,
                        send_capacity,
                    ));
                }
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    error!(server = %self.shared.id, "accept failed: {e}");
                    self.shared.handler().on_error(&Error::Io(e));
                }
            }
        }
        debug!(server = %self.shared.id, "accept loop closed");
    }
}

impl std::fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServer")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("started", &self.is_started())
            .field("sessions", &self.connected_sessions())
            .finish()
    }
}
