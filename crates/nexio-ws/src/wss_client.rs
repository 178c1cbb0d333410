//! Secure WebSocket client layered on the TLS transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot};
use nexio_http::HttpResponse;
use nexio_tls::{TlsClient, TlsClientHandler, TlsContext};

use crate::frame::{FrameDecoder, Opcode, WsFrame, encode_close_frame, encode_frame, random_mask};
use crate::handshake::{make_key, make_upgrade_request, validate_upgrade_response};

/// Notification hooks for a [`WssClient`].
#[async_trait]
pub trait WssClientHandler: Send + Sync + 'static {
    /// The transport (TLS) layer is ready; the upgrade request follows.
    async fn on_connected(&self, _client: &WssClient) {}
    /// The WebSocket handshake completed.
    async fn on_ws_connected(&self, _client: &WssClient, _response: &HttpResponse) {}
    /// A data frame arrived (text, binary, or a tolerated unknown).
    async fn on_ws_received(&self, _client: &WssClient, _opcode: Opcode, _data: &[u8]) {}
    /// A ping arrived; a pong is sent automatically afterwards.
    async fn on_ws_ping(&self, _client: &WssClient, _data: &[u8]) {}
    /// A pong arrived.
    async fn on_ws_pong(&self, _client: &WssClient, _data: &[u8]) {}
    /// A close frame arrived; the close reply and disconnect follow
    /// automatically.
    async fn on_ws_close(&self, _client: &WssClient, _status: u16, _reason: &[u8]) {}
    /// The handshake or framing failed; the client disconnects.
    async fn on_ws_error(&self, _client: &WssClient, _error: &str) {}
    /// The client disconnected.
    async fn on_disconnected(&self, _client: &WssClient) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _client: &WssClient, _error: &Error) {}
}

/// No-op client hooks.
#[derive(Debug, Default)]
pub struct NullWssClientHandler;

impl WssClientHandler for NullWssClientHandler {}

struct ClientState {
    host: String,
    target: Mutex<String>,
    origin: Mutex<Option<String>>,
    protocol: Mutex<Option<String>>,
    key: Mutex<Option<String>>,
    handshaked: AtomicBool,
    closing: AtomicBool,
    response: Mutex<HttpResponse>,
    decoder: Mutex<FrameDecoder>,
    handler: Mutex<Arc<dyn WssClientHandler>>,
}

struct ClientAdapter {
    state: Arc<ClientState>,
}

impl ClientAdapter {
    fn ws(&self, tls: &TlsClient) -> WssClient {
        WssClient {
            tls: tls.clone(),
            state: Arc::clone(&self.state),
        }
    }

    async fn dispatch(&self, client: &WssClient, frame: WsFrame) {
        let handler = self.state.handler.lock().clone();
        match frame.opcode {
            Opcode::Ping => {
                handler.on_ws_ping(client, &frame.payload).await;
                client.send_pong_async(&frame.payload);
            }
            Opcode::Pong => {
                handler.on_ws_pong(client, &frame.payload).await;
            }
            Opcode::Close => {
                let status = frame.close_status().unwrap_or(1000);
                handler
                    .on_ws_close(client, status, frame.close_reason())
                    .await;
                if !self.state.closing.swap(true, Ordering::AcqRel) {
                    let mut reply = Vec::new();
                    encode_close_frame(1000, b"", Some(random_mask()), &mut reply);
                    if !client.tls.send_async(&reply) {
                        client.tls.disconnect_async();
                    }
                }
            }
            opcode => {
                handler.on_ws_received(client, opcode, &frame.payload).await;
            }
        }
    }
}

#[async_trait]
impl TlsClientHandler for ClientAdapter {
    async fn on_handshaked(&self, tls: &TlsClient) {
        let client = self.ws(tls);
        let handler = self.state.handler.lock().clone();
        handler.on_connected(&client).await;

        // TLS is up: perform the RFC 6455 upgrade.
        let key = make_key(&tls.id());
        *self.state.key.lock() = Some(key.clone());
        let request = make_upgrade_request(
            &self.state.host,
            &self.state.target.lock().clone(),
            &key,
            self.state.origin.lock().clone().as_deref(),
            self.state.protocol.lock().clone().as_deref(),
        );
        debug!(client = %tls.id(), "sending WebSocket upgrade request");
        tls.send_async(request.cache());
    }

    async fn on_received(&self, tls: &TlsClient, buffer: &[u8]) -> usize {
        let client = self.ws(tls);

        if !self.state.handshaked.load(Ordering::Acquire) {
            let completed = {
                let mut response = self.state.response.lock();
                if response.is_pending_header() {
                    response.receive_header(buffer);
                } else {
                    response.receive_body(buffer);
                }
                if response.is_error() {
                    Some(Err("invalid HTTP response".to_string()))
                } else if response.is_ready() {
                    Some(Ok(std::mem::take(&mut *response)))
                } else {
                    None
                }
            };
            match completed {
                Some(Ok(response)) => {
                    let key = self.state.key.lock().clone().unwrap_or_default();
                    match validate_upgrade_response(&response, &key) {
                        Ok(()) => {
                            self.state.handshaked.store(true, Ordering::Release);
                            debug!(client = %tls.id(), "WebSocket handshaked");
                            let handler = self.state.handler.lock().clone();
                            handler.on_ws_connected(&client, &response).await;
                            // Frames pipelined right after the 101.
                            let excess = response.body_excess().to_vec();
                            if !excess.is_empty() {
                                let frames = self.state.decoder.lock().feed(&excess);
                                for frame in frames {
                                    self.dispatch(&client, frame).await;
                                }
                            }
                        }
                        Err(reason) => {
                            warn!(client = %tls.id(), "WebSocket upgrade failed: {reason}");
                            let handler = self.state.handler.lock().clone();
                            handler.on_ws_error(&client, &reason).await;
                            tls.disconnect_async();
                        }
                    }
                }
                Some(Err(reason)) => {
                    let handler = self.state.handler.lock().clone();
                    handler.on_ws_error(&client, &reason).await;
                    tls.disconnect_async();
                }
                None => {}
            }
            return buffer.len();
        }

        let frames = self.state.decoder.lock().feed(buffer);
        for frame in frames {
            self.dispatch(&client, frame).await;
        }
        buffer.len()
    }

    async fn on_empty(&self, tls: &TlsClient) {
        if self.state.closing.load(Ordering::Acquire) {
            tls.disconnect_async();
        }
    }

    async fn on_disconnected(&self, tls: &TlsClient) {
        self.state.handshaked.store(false, Ordering::Release);
        self.state.closing.store(false, Ordering::Release);
        self.state.response.lock().clear();
        self.state.decoder.lock().clear();
        let client = self.ws(tls);
        let handler = self.state.handler.lock().clone();
        handler.on_disconnected(&client).await;
    }

    fn on_error(&self, tls: &TlsClient, error: &Error) {
        let client = self.ws(tls);
        self.state.handler.lock().clone().on_error(&client, error);
    }
}

/// Secure WebSocket client. Cloning is cheap and shares the client.
#[derive(Clone)]
pub struct WssClient {
    tls: TlsClient,
    state: Arc<ClientState>,
}

impl WssClient {
    /// Create a client targeting a known endpoint. Fails fast when the
    /// context carries no client configuration.
    pub fn new(service: &Service, endpoint: SocketAddr, context: &TlsContext) -> Result<Self> {
        Self::wrap(
            TlsClient::new(service, endpoint, context)?,
            endpoint.to_string(),
        )
    }

    /// Create a client resolving `host:port`; the host doubles as the SNI
    /// name and the `Host` header.
    pub fn with_host(
        service: &Service,
        host: impl Into<String>,
        port: u16,
        context: &TlsContext,
    ) -> Result<Self> {
        let host = host.into();
        Self::wrap(
            TlsClient::with_host(service, host.clone(), port, context)?,
            format!("{host}:{port}"),
        )
    }

    fn wrap(tls: TlsClient, host: String) -> Result<Self> {
        let state = Arc::new(ClientState {
            host,
            target: Mutex::new("/".to_string()),
            origin: Mutex::new(None),
            protocol: Mutex::new(None),
            key: Mutex::new(None),
            handshaked: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            response: Mutex::new(HttpResponse::new()),
            decoder: Mutex::new(FrameDecoder::new()),
            handler: Mutex::new(Arc::new(NullWssClientHandler)),
        });
        tls.set_handler(Arc::new(ClientAdapter {
            state: Arc::clone(&state),
        }));
        Ok(Self { tls, state })
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
    pub fn set_handler(&self, handler: Arc<dyn WssClientHandler>) {
        *self.state.handler.lock() = handler;
    }

    /// Replace the endpoint options applied on connect.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tls.set_options(options);
    }

    /// Override the SNI name presented during the TLS handshake.
    pub fn set_server_name(&self, name: impl Into<String>) {
        self.tls.set_server_name(name);
    }

    /// Request target of the upgrade request (defaults to `/`).
    pub fn set_target(&self, target: impl Into<String>) {
        *self.state.target.lock() = target.into();
    }

    /// Optional `Origin` header of the upgrade request.
    pub fn set_origin(&self, origin: impl Into<String>) {
        *self.state.origin.lock() = Some(origin.into());
    }

    /// Optional `Sec-WebSocket-Protocol` header of the upgrade request.
    pub fn set_protocol(&self, protocol: impl Into<String>) {
        *self.state.protocol.lock() = Some(protocol.into());
    }

    /// Whether the WebSocket upgrade completed.
    pub fn is_ws_handshaked(&self) -> bool {
        self.state.handshaked.load(Ordering::Acquire) && self.tls.is_handshaked()
    }

    /// Transfer statistics for the current connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tls.stats()
    }

    /// The underlying transport client.
    pub fn transport(&self) -> &TlsClient {
        &self.tls
    }

    /// Connect, TLS-handshake and upgrade asynchronously.
    pub fn connect_async(&self) -> bool {
        self.tls.connect_async()
    }

    /// Connect and TLS-handshake synchronously; the upgrade then runs on
    /// the driver task (watch [`is_ws_handshaked`](Self::is_ws_handshaked)
    /// or `on_ws_connected`).
    pub fn connect(&self) -> Result<()> {
        self.tls.connect()
    }

    /// Disconnect without a close handshake and block until teardown.
    pub fn disconnect(&self) -> Result<()> {
        self.tls.disconnect()
    }

    /// Request a disconnect without a close handshake.
    pub fn disconnect_async(&self) -> bool {
        self.tls.disconnect_async()
    }

    /// Queue a masked text frame.
    pub fn send_text_async(&self, text: &[u8]) -> bool {
        self.send_frame(Opcode::Text, text)
    }

    /// Queue a masked binary frame.
    pub fn send_binary_async(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Binary, data)
    }

    /// Queue a masked ping frame.
    pub fn send_ping_async(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Ping, data)
    }

    /// Queue a masked pong frame.
    pub fn send_pong_async(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Pong, data)
    }

    /// Send a close frame and disconnect once it drained.
    pub fn close(&self, status: u16) -> bool {
        self.close_with_reason(status, b"")
    }

    /// Send a close frame carrying a reason and disconnect once it
    /// drained.
    pub fn close_with_reason(&self, status: u16, reason: &[u8]) -> bool {
        if self.state.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut frame = Vec::with_capacity(8 + reason.len());
        encode_close_frame(status, reason, Some(random_mask()), &mut frame);
        if !self.tls.send_async(&frame) {
            return self.tls.disconnect_async();
        }
        true
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_ws_handshaked() {
            return false;
        }
        let mut frame = Vec::with_capacity(payload.len() + 14);
        encode_frame(opcode, Some(random_mask()), payload, &mut frame);
        self.tls.send_async(&frame)
    }
}

impl std::fmt::Debug for WssClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WssClient")
            .field("id", &self.id())
            .field("ws_handshaked", &self.is_ws_handshaked())
            .finish()
    }
}
