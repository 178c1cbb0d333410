//! HTTPS client and the extended future-returning client over TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot, Timer};
use nexio_tls::{TlsClient, TlsClientHandler, TlsContext};

use crate::client::ResponseFuture;
use crate::pipeline::{self, ResponseStep};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Notification hooks for an [`HttpsClient`].
#[async_trait]
pub trait HttpsClientHandler: Send + Sync + 'static {
    /// The transport connection is established; the handshake follows.
    async fn on_connected(&self, _client: &HttpsClient) {}
    /// The TLS handshake completed; requests may flow.
    async fn on_handshaked(&self, _client: &HttpsClient) {}
    /// The client disconnected.
    async fn on_disconnected(&self, _client: &HttpsClient) {}
    /// The header block of a response arrived (its body may be pending).
    async fn on_received_response_header(&self, _client: &HttpsClient, _response: &HttpResponse) {}
    /// A complete response arrived.
    async fn on_received_response(&self, _client: &HttpsClient, _response: &HttpResponse) {}
    /// The parser hit malformed input; the client disconnects after this.
    async fn on_received_response_error(
        &self,
        _client: &HttpsClient,
        _response: &HttpResponse,
        _error: &str,
    ) {
    }
    /// A non-benign transport or handshake error occurred.
    fn on_error(&self, _client: &HttpsClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullHttpsClientHandler;

impl HttpsClientHandler for NullHttpsClientHandler {}

struct ClientState {
    handler: Mutex<Arc<dyn HttpsClientHandler>>,
    response: Mutex<HttpResponse>,
}

struct ClientAdapter {
    state: Arc<ClientState>,
}

impl ClientAdapter {
    fn https(&self, tls: &TlsClient) -> HttpsClient {
        HttpsClient {
            tls: tls.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl TlsClientHandler for ClientAdapter {
    async fn on_connected(&self, client: &TlsClient) {
        let https = self.https(client);
        let handler = self.state.handler.lock().clone();
        handler.on_connected(&https).await;
    }

    async fn on_handshaked(&self, client: &TlsClient) {
        let https = self.https(client);
        let handler = self.state.handler.lock().clone();
        handler.on_handshaked(&https).await;
    }

    async fn on_disconnected(&self, client: &TlsClient) {
        let finished = pipeline::finish_response(&mut self.state.response.lock());
        let https = self.https(client);
        let handler = self.state.handler.lock().clone();
        if let Some(response) = finished {
            handler.on_received_response(&https, &response).await;
        }
        handler.on_disconnected(&https).await;
    }

    async fn on_received(&self, client: &TlsClient, buffer: &[u8]) -> usize {
        let steps = pipeline::advance_response(&mut self.state.response.lock(), buffer);
        let https = self.https(client);
        let handler = self.state.handler.lock().clone();
        for step in steps {
            match step {
                ResponseStep::Header(response) => {
                    handler
                        .on_received_response_header(&https, &response)
                        .await;
                }
                ResponseStep::Complete(response) => {
                    handler.on_received_response(&https, &response).await;
                }
                ResponseStep::Error(response) => {
                    handler
                        .on_received_response_error(&https, &response, "invalid HTTP response")
                        .await;
                    https.disconnect_async();
                }
            }
        }
        buffer.len()
    }

    fn on_error(&self, client: &TlsClient, error: &Error) {
        let https = self.https(client);
        self.state.handler.lock().clone().on_error(&https, error);
    }
}

/// HTTP/1.1 client over TLS. Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct HttpsClient {
    tls: TlsClient,
    state: Arc<ClientState>,
}

impl HttpsClient {
    /// Create a client targeting a known endpoint. Fails fast when the
    /// context carries no client configuration.
    pub fn new(service: &Service, endpoint: SocketAddr, context: &TlsContext) -> Result<Self> {
        Ok(Self::wrap(TlsClient::new(service, endpoint, context)?))
    }

    /// Create a client resolving `host:port`; the host doubles as the SNI
    /// name.
    pub fn with_host(
        service: &Service,
        host: impl Into<String>,
        port: u16,
        context: &TlsContext,
    ) -> Result<Self> {
        Ok(Self::wrap(TlsClient::with_host(
            service, host, port, context,
        )?))
    }

    fn wrap(tls: TlsClient) -> Self {
        let state = Arc::new(ClientState {
            handler: Mutex::new(Arc::new(NullHttpsClientHandler)),
            response: Mutex::new(HttpResponse::new()),
        });
        tls.set_handler(Arc::new(ClientAdapter {
            state: Arc::clone(&state),
        }));
        Self { tls, state }
    }

    /// The client identifier.
    pub fn id(&self) -> EndpointId {
        self.tls.id()
    }

    /// The reactor service this client is bound to.
    pub fn service(&self) -> &Service {
        self.tls.service()
    }

    /// Install the client handler.
    pub fn set_handler(&self, handler: Arc<dyn HttpsClientHandler>) {
        *self.state.handler.lock() = handler;
    }

    /// Replace the endpoint options applied on connect.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tls.set_options(options);
    }

    /// Override the SNI name presented during the handshake.
    pub fn set_server_name(&self, name: impl Into<String>) {
        self.tls.set_server_name(name);
    }

    /// Whether the TLS handshake completed.
    pub fn is_handshaked(&self) -> bool {
        self.tls.is_handshaked()
    }

    /// Transfer statistics for the current connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tls.stats()
    }

    /// The underlying transport client.
    pub fn transport(&self) -> &TlsClient {
        &self.tls
    }

    /// Connect and handshake synchronously.
    pub fn connect(&self) -> Result<()> {
        self.tls.connect()
    }

    /// Connect asynchronously; the handshake chains onto the connect.
    pub fn connect_async(&self) -> bool {
        self.tls.connect_async()
    }

    /// Disconnect and block until the teardown completes.
    pub fn disconnect(&self) -> Result<()> {
        self.tls.disconnect()
    }

    /// Request a disconnect.
    pub fn disconnect_async(&self) -> bool {
        self.tls.disconnect_async()
    }

    /// Disconnect, wait for teardown, connect again.
    pub fn reconnect(&self) -> Result<()> {
        self.tls.reconnect()
    }

    /// Send a request and block until it drained.
    pub fn send_request(&self, request: &HttpRequest) -> Result<usize> {
        self.tls.send(request.cache())
    }

    /// Queue a request for sending.
    pub fn send_request_async(&self, request: &HttpRequest) -> bool {
        self.tls.send_async(request.cache())
    }
}

impl std::fmt::Debug for HttpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsClient")
            .field("id", &self.id())
            .field("handshaked", &self.is_handshaked())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Extended client
// ---------------------------------------------------------------------------

struct PendingRequest {
    reply: oneshot::Sender<Result<HttpResponse>>,
    timer: Timer,
    unsent: Option<Vec<u8>>,
}

struct ExShared {
    pending: Mutex<Option<PendingRequest>>,
}

impl ExShared {
    fn resolve(&self, result: Result<HttpResponse>) {
        if let Some(pending) = self.pending.lock().take() {
            pending.timer.cancel();
            let _ = pending.reply.send(result);
        }
    }
}

/// Extended HTTPS client: one outstanding request with a response future
/// and a timeout that disconnects and rejects.
#[derive(Clone)]
pub struct HttpsClientEx {
    client: HttpsClient,
    shared: Arc<ExShared>,
}

struct ExHandler {
    shared: Arc<ExShared>,
}

#[async_trait]
impl HttpsClientHandler for ExHandler {
    async fn on_handshaked(&self, client: &HttpsClient) {
        let unsent = self
            .shared
            .pending
            .lock()
            .as_mut()
            .and_then(|pending| pending.unsent.take());
        if let Some(bytes) = unsent {
            client.transport().send_async(&bytes);
        }
    }

    async fn on_disconnected(&self, _client: &HttpsClient) {
        self.shared
            .resolve(Err(Error::ConnectionFailed("disconnected".into())));
    }

    async fn on_received_response(&self, _client: &HttpsClient, response: &HttpResponse) {
        self.shared.resolve(Ok(response.clone()));
    }

    async fn on_received_response_error(
        &self,
        _client: &HttpsClient,
        _response: &HttpResponse,
        error: &str,
    ) {
        self.shared.resolve(Err(Error::Protocol(error.to_string())));
    }

    fn on_error(&self, _client: &HttpsClient, error: &Error) {
        self.shared
            .resolve(Err(Error::ConnectionFailed(error.to_string())));
    }
}

impl HttpsClientEx {
    /// Create an extended client targeting a known endpoint.
    pub fn new(service: &Service, endpoint: SocketAddr, context: &TlsContext) -> Result<Self> {
        Ok(Self::wrap(HttpsClient::new(service, endpoint, context)?))
    }

    /// Create an extended client resolving `host:port`.
    pub fn with_host(
        service: &Service,
        host: impl Into<String>,
        port: u16,
        context: &TlsContext,
    ) -> Result<Self> {
        Ok(Self::wrap(HttpsClient::with_host(
            service, host, port, context,
        )?))
    }

    fn wrap(client: HttpsClient) -> Self {
        let shared = Arc::new(ExShared {
            pending: Mutex::new(None),
        });
        client.set_handler(Arc::new(ExHandler {
            shared: Arc::clone(&shared),
        }));
        Self { client, shared }
    }

    /// The wrapped plain client.
    pub fn client(&self) -> &HttpsClient {
        &self.client
    }

    /// Send a request, connecting (and handshaking) on demand, and return
    /// a future for its response.
    pub fn send_request(&self, request: &HttpRequest, timeout: Duration) -> Result<ResponseFuture> {
        let mut pending = self.shared.pending.lock();
        if pending.is_some() {
            return Err(Error::Configuration(
                "a request is already in flight".into(),
            ));
        }

        let (reply, receiver) = oneshot::channel();
        let timer = Timer::with_duration(self.client.service(), timeout);
        {
            let shared = Arc::clone(&self.shared);
            let client = self.client.clone();
            timer.setup_action(move |canceled| {
                if !canceled {
                    warn!(client = %client.id(), "request timed out; disconnecting");
                    shared.resolve(Err(Error::Timeout));
                    client.disconnect_async();
                }
            });
        }

        let handshaked = self.client.is_handshaked();
        *pending = Some(PendingRequest {
            reply,
            timer: timer.clone(),
            unsent: (!handshaked).then(|| request.cache().to_vec()),
        });
        drop(pending);

        timer.wait_async();
        if handshaked {
            debug!(client = %self.client.id(), "sending request on live connection");
            self.client.send_request_async(request);
        } else {
            self.client.connect_async();
        }
        Ok(ResponseFuture::new(receiver))
    }

    /// Send a request and block for the response. Must be called from
    /// outside the service's worker threads.
    pub fn fetch(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        let future = self.send_request(request, timeout)?;
        self.client.service().block_on(future)?
    }

    /// GET convenience request.
    pub fn send_get(&self, url: &str, timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_get_request(url);
        self.send_request(&request, timeout)
    }

    /// POST convenience request.
    pub fn send_post(&self, url: &str, content: &[u8], timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_post_request(url, content);
        self.send_request(&request, timeout)
    }
}

impl std::fmt::Debug for HttpsClientEx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsClientEx")
            .field("id", &self.client.id())
            .field("in_flight", &self.shared.pending.lock().is_some())
            .finish()
    }
}
