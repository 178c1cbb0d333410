//! HTTP server and session over the TCP transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot};
use nexio_tcp::{TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};

use crate::cache::FileCache;
use crate::pipeline::{self, RequestStep};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// One accepted HTTP connection.
#[derive(Clone, Debug)]
pub struct HttpSession {
    tcp: TcpSession,
}

impl HttpSession {
    fn new(tcp: &TcpSession) -> Self {
        Self { tcp: tcp.clone() }
    }

    /// The session identifier.
    pub fn id(&self) -> EndpointId {
        self.tcp.id()
    }

    /// Remote peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.tcp.peer_address()
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        self.tcp.is_connected()
    }

    /// Transfer statistics for this connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tcp.stats()
    }

    /// The underlying transport session.
    pub fn transport(&self) -> &TcpSession {
        &self.tcp
    }

    /// Queue a response for sending.
    pub fn send_response_async(&self, response: &HttpResponse) -> bool {
        self.tcp.send_async(response.cache())
    }

    /// Send a response and block until it drained. Must be called from
    /// outside the service's worker threads.
    pub fn send_response(&self, response: &HttpResponse) -> Result<usize> {
        self.tcp.send(response.cache())
    }

    /// Queue raw pre-framed bytes (a cached response) for sending.
    pub fn send_async(&self, data: &[u8]) -> bool {
        self.tcp.send_async(data)
    }

    /// Disconnect the session.
    pub fn disconnect(&self) -> bool {
        self.tcp.disconnect()
    }
}

/// Notification hooks for an [`HttpServer`].
#[async_trait]
pub trait HttpServerHandler: Send + Sync + 'static {
    /// A session connected.
    async fn on_connected(&self, _session: &HttpSession) {}
    /// A session disconnected.
    async fn on_disconnected(&self, _session: &HttpSession) {}
    /// The header block of a request arrived (its body may be pending).
    async fn on_received_request_header(&self, _session: &HttpSession, _request: &HttpRequest) {}
    /// A complete request arrived.
    async fn on_received_request(&self, _session: &HttpSession, _request: &HttpRequest) {}
    /// A GET hit the static file cache; the default sends the cached
    /// pre-framed response as-is.
    async fn on_received_cached_request(
        &self,
        session: &HttpSession,
        _request: &HttpRequest,
        content: &[u8],
    ) {
        session.send_async(content);
    }
    /// The parser hit malformed input; the session disconnects after this.
    async fn on_received_request_error(
        &self,
        _session: &HttpSession,
        _request: &HttpRequest,
        _error: &str,
    ) {
    }
    /// A non-benign transport error occurred.
    fn on_error(&self, _error: &Error) {}
}

/// No-op server hooks.
#[derive(Debug, Default)]
pub struct NullHttpServerHandler;

impl HttpServerHandler for NullHttpServerHandler {}

/// Bridges the TCP server callbacks onto the HTTP handler.
struct ServerAdapter {
    handler: Arc<dyn HttpServerHandler>,
    cache: FileCache,
}

impl TcpServerHandler for ServerAdapter {
    fn create_session(&self, _session: &TcpSession) -> Arc<dyn TcpSessionHandler> {
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

/// Per-session parser state feeding the HTTP handler.
struct SessionAdapter {
    handler: Arc<dyn HttpServerHandler>,
    cache: FileCache,
    request: Mutex<HttpRequest>,
}

impl SessionAdapter {
    async fn dispatch(&self, session: &HttpSession, request: &HttpRequest) {
        // GET requests consult the file cache first (query stripped).
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
impl TcpSessionHandler for SessionAdapter {
    async fn on_connected(&self, session: &TcpSession) {
        self.handler.on_connected(&HttpSession::new(session)).await;
    }

    async fn on_disconnected(&self, session: &TcpSession) {
        let finished = pipeline::finish_request(&mut self.request.lock());
        let session = HttpSession::new(session);
        if let Some(request) = finished {
            self.dispatch(&session, &request).await;
        }
        self.handler.on_disconnected(&session).await;
    }

    async fn on_received(&self, session: &TcpSession, buffer: &[u8]) -> usize {
        let steps = pipeline::advance_request(&mut self.request.lock(), buffer);
        let session = HttpSession::new(session);
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

/// HTTP/1.1 server. Cloning is cheap and shares the server.
#[derive(Clone)]
pub struct HttpServer {
    tcp: TcpServer,
    cache: FileCache,
    handler: Arc<Mutex<Arc<dyn HttpServerHandler>>>,
}

impl HttpServer {
    /// Create a server bound to `address` once started.
    #[must_use]
    pub fn new(service: &Service, address: SocketAddr) -> Self {
        Self {
            tcp: TcpServer::new(service, address),
            cache: FileCache::new(),
            handler: Arc::new(Mutex::new(Arc::new(NullHttpServerHandler))),
        }
    }

    /// The server identifier.
    pub fn id(&self) -> EndpointId {
        self.tcp.id()
    }

    /// The reactor service this server is bound to.
    pub fn service(&self) -> &Service {
        self.tcp.service()
    }

    /// The static file cache consulted by GET sessions.
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Install the server handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn HttpServerHandler>) {
        *self.handler.lock() = handler;
    }

    /// Replace the endpoint options applied at `start` and on accept.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tcp.set_options(options);
    }

    /// Populate the file cache from a directory; entries are fully framed
    /// 200 responses keyed `<prefix>/<relative path>`.
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
        self.tcp.is_started()
    }

    /// The actual bound address, once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.tcp.bound_address()
    }

    /// Number of currently connected sessions.
    pub fn connected_sessions(&self) -> usize {
        self.tcp.connected_sessions()
    }

    /// Aggregate transfer statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.tcp.stats()
    }

    /// Bind, listen and accept HTTP sessions.
    pub fn start(&self) -> Result<()> {
        self.tcp.set_handler(Arc::new(ServerAdapter {
            handler: Arc::clone(&self.handler.lock()),
            cache: self.cache.clone(),
        }));
        self.tcp.start()
    }

    /// Close the acceptor and disconnect every session.
    pub fn stop(&self) -> bool {
        self.tcp.stop()
    }

    /// `stop`, drain, `start`.
    pub fn restart(&self) -> Result<()> {
        self.tcp.restart()
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("id", &self.id())
            .field("started", &self.is_started())
            .finish()
    }
}
