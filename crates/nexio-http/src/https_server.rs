//! HTTPS server and session: the HTTP contract over the TLS transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot};
use nexio_tls::{TlsContext, TlsServer, TlsServerHandler, TlsSession, TlsSessionHandler};

use crate::cache::FileCache;
use crate::pipeline::{self, RequestStep};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// One accepted HTTPS connection.
#[derive(Clone, Debug)]
pub struct HttpsSession {
    tls: TlsSession,
}

impl HttpsSession {
    fn new(tls: &TlsSession) -> Self {
        Self { tls: tls.clone() }
    }

    /// The session identifier.
    pub fn id(&self) -> EndpointId {
        self.tls.id()
    }

    /// Remote peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.tls.peer_address()
    }

    /// Whether the TLS handshake completed.
    pub fn is_handshaked(&self) -> bool {
        self.tls.is_handshaked()
    }

    /// Transfer statistics for this connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tls.stats()
    }

    /// The underlying transport session.
    pub fn transport(&self) -> &TlsSession {
        &self.tls
    }

    /// Queue a response for sending.
    pub fn send_response_async(&self, response: &HttpResponse) -> bool {
        self.tls.send_async(response.cache())
    }

    /// Send a response and block until it drained. Must be called from
    /// outside the service's worker threads.
    pub fn send_response(&self, response: &HttpResponse) -> Result<usize> {
        self.tls.send(response.cache())
    }

    /// Queue raw pre-framed bytes (a cached response) for sending.
    pub fn send_async(&self, data: &[u8]) -> bool {
        self.tls.send_async(data)
    }

    /// Disconnect the session.
    pub fn disconnect(&self) -> bool {
        self.tls.disconnect()
    }
}

/// Notification hooks for an [`HttpsServer`].
#[async_trait]
pub trait HttpsServerHandler: Send + Sync + 'static {
    /// A session completed its TLS handshake.
    async fn on_handshaked(&self, _session: &HttpsSession) {}
    /// A session disconnected.
    async fn on_disconnected(&self, _session: &HttpsSession) {}
    /// The header block of a request arrived (its body may be pending).
    async fn on_received_request_header(&self, _session: &HttpsSession, _request: &HttpRequest) {}
    /// A complete request arrived.
    async fn on_received_request(&self, _session: &HttpsSession, _request: &HttpRequest) {}
    /// A GET hit the static file cache; the default sends the cached
    /// pre-framed response as-is.
    async fn on_received_cached_request(
        &self,
        session: &HttpsSession,
        _request: &HttpRequest,
        content: &[u8],
    ) {
        session.send_async(content);
    }
    /// The parser hit malformed input; the session disconnects after this.
    async fn on_received_request_error(
        &self,
        _session: &HttpsSession,
        _request: &HttpRequest,
        _error: &str,
    ) {
    }
    /// A non-benign transport or handshake error occurred.
    fn on_error(&self, _error: &Error) {}
}

/// No-op server hooks.
#[derive(Debug, Default)]
pub struct NullHttpsServerHandler;

impl HttpsServerHandler for NullHttpsServerHandler {}

struct ServerAdapter {
    handler: Arc<dyn HttpsServerHandler>,
    cache: FileCache,
}

impl TlsServerHandler for ServerAdapter {
    fn create_session(&self, _session: &TlsSession) -> Arc<dyn TlsSessionHandler> {
        Arc::new(SessionAdapter {
            handler: Arc::clone(&self.handler),
            cache: self.cache.clone(),
            request: Mutex::new(HttpRequest::new()),
        })
    }

    fn on_error(&self, error: &Error) {
        self.handler.on_error(error);
    }
}

struct SessionAdapter {
    handler: Arc<dyn HttpsServerHandler>,
    cache: FileCache,
    request: Mutex<HttpRequest>,
}

impl SessionAdapter {
    async fn dispatch(&self, session: &HttpsSession, request: &HttpRequest) {
        if request.method() == "GET" {
            let url = request.url();
            let path = url.split('?').next().unwrap_or(url);
            if let Some(content) = self.cache.find(path) {
                debug!(%path, "served from file cache");
                self.handler
                    .on_received_cached_request(session, request, &content)
                    .await;
                return;
            }
        }
        self.handler.on_received_request(session, request).await;
    }
}

#[async_trait]
impl TlsSessionHandler for SessionAdapter {
    async fn on_handshaked(&self, session: &TlsSession) {
        self.handler
            .on_handshaked(&HttpsSession::new(session))
            .await;
    }

    async fn on_disconnected(&self, session: &TlsSession) {
        let finished = pipeline::finish_request(&mut self.request.lock());
        let session = HttpsSession::new(session);
        if let Some(request) = finished {
            self.dispatch(&session, &request).await;
        }
        self.handler.on_disconnected(&session).await;
    }

    async fn on_received(&self, session: &TlsSession, buffer: &[u8]) -> usize {
        let steps = pipeline::advance_request(&mut self.request.lock(), buffer);
        let session = HttpsSession::new(session);
        for step in steps {
            match step {
                RequestStep::Header(request) => {
                    self.handler
                        .on_received_request_header(&session, &request)
                        .await;
                }
                RequestStep::Complete(request) => {
                    self.dispatch(&session, &request).await;
                }
                RequestStep::Error(request) => {
                    self.handler
                        .on_received_request_error(&session, &request, "invalid HTTP request")
                        .await;
                    session.disconnect();
                }
            }
        }
        buffer.len()
    }
}

/// HTTPS server. Cloning is cheap and shares the server.
#[derive(Clone)]
pub struct HttpsServer {
    tls: TlsServer,
    cache: FileCache,
    handler: Arc<Mutex<Arc<dyn HttpsServerHandler>>>,
}

impl HttpsServer {
    /// Create a server bound to `address` once started. Fails fast when
    /// the context carries no server configuration.
    pub fn new(service: &Service, address: SocketAddr, context: &TlsContext) -> Result<Self> {
        Ok(Self {
            tls: TlsServer::new(service, address, context)?,
            cache: FileCache::new(),
            handler: Arc::new(Mutex::new(Arc::new(NullHttpsServerHandler))),
        })
    }

    /// The server identifier.
    pub fn id(&self) -> EndpointId {
        self.tls.id()
    }

    /// The reactor service this server is bound to.
    pub fn service(&self) -> &Service {
        self.tls.service()
    }

    /// The static file cache consulted by GET sessions.
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// The underlying TLS server (used by the WebSocket layer for
    /// multicast).
    pub fn transport(&self) -> &TlsServer {
        &self.tls
    }

    /// Install the server handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn HttpsServerHandler>) {
        *self.handler.lock() = handler;
    }

    /// Replace the endpoint options applied at `start` and on accept.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tls.set_options(options);
    }

    /// Populate the file cache from a directory.
    pub fn cache_path(
        &self,
        prefix: &str,
        root: impl AsRef<std::path::Path>,
        ttl: Option<Duration>,
    ) -> std::io::Result<usize> {
        self.cache.insert_path(prefix, root, ttl)
    }

    /// Whether the acceptor is running.
    pub fn is_started(&self) -> bool {
        self.tls.is_started()
    }

    /// The actual bound address, once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.tls.bound_address()
    }

    /// Number of currently registered sessions.
    pub fn connected_sessions(&self) -> usize {
        self.tls.connected_sessions()
    }

    /// Aggregate transfer statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.tls.stats()
    }

    /// Bind, listen and accept HTTPS sessions.
    pub fn start(&self) -> Result<()> {
        self.tls.set_handler(Arc::new(ServerAdapter {
            handler: Arc::clone(&self.handler.lock()),
            cache: self.cache.clone(),
        }));
        self.tls.start()
    }

    /// Close the acceptor and disconnect every session.
    pub fn stop(&self) -> bool {
        self.tls.stop()
    }

    /// `stop`, drain, `start`.
    pub fn restart(&self) -> Result<()> {
        self.tls.restart()
    }
}

impl std::fmt::Debug for HttpsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsServer")
            .field("id", &self.id())
            .field("started", &self.is_started())
            .finish()
    }
}
