//! HTTP client and the extended future-returning client.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot, Timer};
use nexio_tcp::{TcpClient, TcpClientHandler};

use crate::pipeline::{self, ResponseStep};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Notification hooks for an [`HttpClient`].
#[async_trait]
pub trait HttpClientHandler: Send + Sync + 'static {
    /// The client connected.
    async fn on_connected(&self, _client: &HttpClient) {}
    /// The client disconnected.
    async fn on_disconnected(&self, _client: &HttpClient) {}
    /// The header block of a response arrived (its body may be pending).
    async fn on_received_response_header(&self, _client: &HttpClient, _response: &HttpResponse) {}
    /// A complete response arrived.
    async fn on_received_response(&self, _client: &HttpClient, _response: &HttpResponse) {}
    /// The parser hit malformed input; the client disconnects after this.
    async fn on_received_response_error(
        &self,
        _client: &HttpClient,
        _response: &HttpResponse,
        _error: &str,
    ) {
    }
    /// A non-benign transport error occurred.
    fn on_error(&self, _client: &HttpClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullHttpClientHandler;

impl HttpClientHandler for NullHttpClientHandler {}

struct ClientState {
    handler: Mutex<Arc<dyn HttpClientHandler>>,
    response: Mutex<HttpResponse>,
}

/// Bridges the TCP client callbacks onto the HTTP handler.
struct ClientAdapter {
    state: Arc<ClientState>,
}

impl ClientAdapter {
    fn http(&self, tcp: &TcpClient) -> HttpClient {
        HttpClient {
            tcp: tcp.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl TcpClientHandler for ClientAdapter {
    async fn on_connected(&self, client: &TcpClient) {
        let http = self.http(client);
        let handler = self.state.handler.lock().clone();
        handler.on_connected(&http).await;
    }

    async fn on_disconnected(&self, client: &TcpClient) {
        let finished = pipeline::finish_response(&mut self.state.response.lock());
        let http = self.http(client);
        let handler = self.state.handler.lock().clone();
        if let Some(response) = finished {
            handler.on_received_response(&http, &response).await;
        }
        handler.on_disconnected(&http).await;
    }

    async fn on_received(&self, client: &TcpClient, buffer: &[u8]) -> usize {
        let steps = pipeline::advance_response(&mut self.state.response.lock(), buffer);
        let http = self.http(client);
        let handler = self.state.handler.lock().clone();
        for step in steps {
            match step {
                ResponseStep::Header(response) => {
                    handler.on_received_response_header(&http, &response).await;
                }
                ResponseStep::Complete(response) => {
                    handler.on_received_response(&http, &response).await;
                }
                ResponseStep::Error(response) => {
                    handler
                        .on_received_response_error(&http, &response, "invalid HTTP response")
                        .await;
                    http.disconnect_async();
                }
            }
        }
        buffer.len()
    }

    fn on_error(&self, client: &TcpClient, error: &Error) {
        let http = self.http(client);
        self.state.handler.lock().clone().on_error(&http, error);
    }
}

/// HTTP/1.1 client over TCP. Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct HttpClient {
    tcp: TcpClient,
    state: Arc<ClientState>,
}

impl HttpClient {
    /// Create a client targeting a known endpoint.
    #[must_use]
    pub fn new(service: &Service, endpoint: SocketAddr) -> Self {
        Self::wrap(TcpClient::new(service, endpoint))
    }

    /// Create a client resolving `host:port` through the system resolver.
    #[must_use]
    pub fn with_host(service: &Service, host: impl Into<String>, port: u16) -> Self {
        Self::wrap(TcpClient::with_host(service, host, port))
    }

    fn wrap(tcp: TcpClient) -> Self {
        let state = Arc::new(ClientState {
            handler: Mutex::new(Arc::new(NullHttpClientHandler)),
            response: Mutex::new(HttpResponse::new()),
        });
        tcp.set_handler(Arc::new(ClientAdapter {
            state: Arc::clone(&state),
        }));
        Self { tcp, state }
    }

    /// The client identifier.
    pub fn id(&self) -> EndpointId {
        self.tcp.id()
    }

    /// The reactor service this client is bound to.
    pub fn service(&self) -> &Service {
        self.tcp.service()
    }

    /// Install the client handler.
    pub fn set_handler(&self, handler: Arc<dyn HttpClientHandler>) {
        *self.state.handler.lock() = handler;
    }

    /// Replace the endpoint options applied on connect.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tcp.set_options(options);
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.tcp.is_connected()
    }

    /// Transfer statistics for the current connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tcp.stats()
    }

    /// The underlying transport client.
    pub fn transport(&self) -> &TcpClient {
        &self.tcp
    }

    /// Connect synchronously (no auto-read).
    pub fn connect(&self) -> Result<()> {
        self.tcp.connect()
    }

    /// Connect asynchronously; responses flow once connected.
    pub fn connect_async(&self) -> bool {
        self.tcp.connect_async()
    }

    /// Disconnect and block until the teardown completes.
    pub fn disconnect(&self) -> Result<()> {
        self.tcp.disconnect()
    }

    /// Request a disconnect.
    pub fn disconnect_async(&self) -> bool {
        self.tcp.disconnect_async()
    }

    /// Disconnect, wait for teardown, connect again.
    pub fn reconnect(&self) -> Result<()> {
        self.tcp.reconnect()
    }

    /// Start the receive chain after a synchronous connect.
    pub fn receive_async(&self) -> bool {
        self.tcp.receive_async()
    }

    /// Send a request and block until it drained.
    pub fn send_request(&self, request: &HttpRequest) -> Result<usize> {
        self.tcp.send(request.cache())
    }

    /// Queue a request for sending.
    pub fn send_request_async(&self, request: &HttpRequest) -> bool {
        self.tcp.send_async(request.cache())
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Extended client
// ---------------------------------------------------------------------------

/// Future resolving to the response of one extended-client request.
pub struct ResponseFuture(oneshot::Receiver<Result<HttpResponse>>);

impl ResponseFuture {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<HttpResponse>>) -> Self {
        Self(receiver)
    }
}

impl Future for ResponseFuture {
    type Output = Result<HttpResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionFailed(
                "request abandoned before completion".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Result<HttpResponse>>,
    timer: Timer,
    /// Request bytes waiting for the connect to complete.
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

/// Extended HTTP client: a one-shot outstanding-request pattern returning a
/// [`ResponseFuture`] per request, with a timeout timer that disconnects
/// and rejects. One request may be in flight per instance; serialization
/// across requests is the caller's responsibility.
#[derive(Clone)]
pub struct HttpClientEx {
    client: HttpClient,
    shared: Arc<ExShared>,
}

/// Internal handler resolving the outstanding request.
struct ExHandler {
    shared: Arc<ExShared>,
}

#[async_trait]
impl HttpClientHandler for ExHandler {
    async fn on_connected(&self, client: &HttpClient) {
        // Send the request that was waiting for this connect.
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

    async fn on_disconnected(&self, _client: &HttpClient) {
        self.shared
            .resolve(Err(Error::ConnectionFailed("disconnected".into())));
    }

    async fn on_received_response(&self, _client: &HttpClient, response: &HttpResponse) {
        self.shared.resolve(Ok(response.clone()));
    }

    async fn on_received_response_error(
        &self,
        _client: &HttpClient,
        _response: &HttpResponse,
        error: &str,
    ) {
        self.shared.resolve(Err(Error::Protocol(error.to_string())));
    }

    fn on_error(&self, _client: &HttpClient, error: &Error) {
        self.shared
            .resolve(Err(Error::ConnectionFailed(error.to_string())));
    }
}

impl HttpClientEx {
    /// Create an extended client targeting a known endpoint.
    #[must_use]
    pub fn new(service: &Service, endpoint: SocketAddr) -> Self {
        Self::wrap(HttpClient::new(service, endpoint))
    }

    /// Create an extended client resolving `host:port`.
    #[must_use]
    pub fn with_host(service: &Service, host: impl Into<String>, port: u16) -> Self {
        Self::wrap(HttpClient::with_host(service, host, port))
    }

    fn wrap(client: HttpClient) -> Self {
        let shared = Arc::new(ExShared {
            pending: Mutex::new(None),
        });
        client.set_handler(Arc::new(ExHandler {
            shared: Arc::clone(&shared),
        }));
        Self { client, shared }
    }

    /// The wrapped plain client.
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Send a request, connecting on demand, and return a future for its
    /// response. The timeout disconnects the client and rejects the future.
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

        let connected = self.client.is_connected();
        *pending = Some(PendingRequest {
            reply,
            timer: timer.clone(),
            unsent: (!connected).then(|| request.cache().to_vec()),
        });
        drop(pending);

        timer.wait_async();
        if connected {
            debug!(client = %self.client.id(), "sending request on live connection");
            self.client.send_request_async(request);
        } else {
            self.client.connect_async();
        }
        Ok(ResponseFuture(receiver))
    }

    /// Send a request and block for the response. Must be called from
    /// outside the service's worker threads.
    pub fn fetch(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        let future = self.send_request(request, timeout)?;
        self.client.service().block_on(future)?
    }

    /// HEAD convenience request.
    pub fn send_head(&self, url: &str, timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_head_request(url);
        self.send_request(&request, timeout)
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

    /// PUT convenience request.
    pub fn send_put(&self, url: &str, content: &[u8], timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_put_request(url, content);
        self.send_request(&request, timeout)
    }

    /// DELETE convenience request.
    pub fn send_delete(&self, url: &str, timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_delete_request(url);
        self.send_request(&request, timeout)
    }

    /// OPTIONS convenience request.
    pub fn send_options(&self, url: &str, timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_options_request(url);
        self.send_request(&request, timeout)
    }

    /// TRACE convenience request.
    pub fn send_trace(&self, url: &str, timeout: Duration) -> Result<ResponseFuture> {
        let mut request = HttpRequest::new();
        request.make_trace_request(url);
        self.send_request(&request, timeout)
    }
}

impl std::fmt::Debug for HttpClientEx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientEx")
            .field("id", &self.client.id())
            .field("in_flight", &self.shared.pending.lock().is_some())
            .finish()
    }
}
