//! Plain WebSocket server and session layered on the TCP transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use nexio_core::{EndpointId, EndpointOptions, Error, Result, Service, StatsSnapshot};
use nexio_http::{HttpRequest, HttpResponse};
use nexio_tcp::{TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};

use crate::frame::{FrameDecoder, Opcode, WsFrame, encode_close_frame, encode_frame};
use crate::handshake::{ServerUpgrade, perform_server_upgrade};

struct WsState {
    handshaked: AtomicBool,
    closing: AtomicBool,
}

impl WsState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handshaked: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        })
    }
}

/// One accepted plain WebSocket connection.
#[derive(Clone)]
pub struct WsSession {
    tcp: TcpSession,
    state: Arc<WsState>,
}

impl WsSession {
    /// The session identifier.
    pub fn id(&self) -> EndpointId {
        self.tcp.id()
    }

    /// Remote peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.tcp.peer_address()
    }

    /// Whether the WebSocket upgrade completed.
    pub fn is_ws_handshaked(&self) -> bool {
        self.state.handshaked.load(Ordering::Acquire) && self.tcp.is_connected()
    }

    /// Transfer statistics for this connection epoch.
    pub fn stats(&self) -> StatsSnapshot {
        self.tcp.stats()
    }

    /// The underlying transport session.
    pub fn transport(&self) -> &TcpSession {
        &self.tcp
    }

    /// Queue a text frame. Server frames are unmasked.
    pub fn send_text_async(&self, text: &[u8]) -> bool {
        self.send_frame(Opcode::Text, text)
    }

    /// Queue a binary frame.
    pub fn send_binary_async(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Binary, data)
    }

    /// Queue a ping frame.
    pub fn send_ping_async(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Ping, data)
    }

    /// Queue a pong frame.
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
        let mut frame = Vec::with_capacity(4 + reason.len());
        encode_close_frame(status, reason, None, &mut frame);
        if !self.tcp.send_async(&frame) {
            return self.tcp.disconnect();
        }
        true
    }

    /// Disconnect without a close handshake.
    pub fn disconnect(&self) -> bool {
        self.tcp.disconnect()
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_ws_handshaked() {
            return false;
        }
        let mut frame = Vec::with_capacity(payload.len() + 10);
        encode_frame(opcode, None, payload, &mut frame);
        self.tcp.send_async(&frame)
    }
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.id())
            .field("ws_handshaked", &self.is_ws_handshaked())
            .finish()
    }
}

/// Notification hooks for a [`WsServer`].
#[async_trait]
pub trait WsServerHandler: Send + Sync + 'static {
    /// The upgrade request validated; returning `false` rejects the
    /// connection before the 101 goes out.
    async fn on_ws_connecting(
        &self,
        _session: &WsSession,
        _request: &HttpRequest,
        _response: &mut HttpResponse,
    ) -> bool {
        true
    }
    /// The WebSocket handshake completed.
    async fn on_ws_connected(&self, _session: &WsSession, _request: &HttpRequest) {}
    /// A data frame arrived (text, binary, or a tolerated unknown).
    async fn on_ws_received(&self, _session: &WsSession, _opcode: Opcode, _data: &[u8]) {}
    /// A ping arrived; a pong is sent automatically afterwards.
    async fn on_ws_ping(&self, _session: &WsSession, _data: &[u8]) {}
    /// A pong arrived.
    async fn on_ws_pong(&self, _session: &WsSession, _data: &[u8]) {}
    /// A close frame arrived; the close reply and disconnect follow
    /// automatically.
    async fn on_ws_close(&self, _session: &WsSession, _status: u16, _reason: &[u8]) {}
    /// The handshake or framing failed; the session disconnects.
    async fn on_ws_error(&self, _session: &WsSession, _error: &str) {}
    /// A request without any WebSocket handshake header fell through to
    /// plain HTTP.
    async fn on_received_request(&self, _session: &WsSession, _request: &HttpRequest) {}
    /// The session disconnected.
    async fn on_disconnected(&self, _session: &WsSession) {}
    /// A non-benign transport error occurred.
    fn on_error(&self, _error: &Error) {}
}

/// No-op server hooks.
#[derive(Debug, Default)]
pub struct NullWsServerHandler;

impl WsServerHandler for NullWsServerHandler {}

type Registry = Arc<RwLock<HashMap<EndpointId, WsSession>>>;

struct ServerAdapter {
    handler: Arc<dyn WsServerHandler>,
    registry: Registry,
}

impl TcpServerHandler for ServerAdapter {
    fn create_session(&self, _session: &TcpSession) -> Arc<dyn TcpSessionHandler> {
        Arc::new(SessionAdapter {
            handler: Arc::clone(&self.handler),
            registry: Arc::clone(&self.registry),
            state: WsState::new(),
            request: Mutex::new(HttpRequest::new()),
            decoder: Mutex::new(FrameDecoder::new()),
        })
    }

    fn on_error(&self, error: &Error) {
        self.handler.on_error(error);
    }
}

struct SessionAdapter {
    handler: Arc<dyn WsServerHandler>,
    registry: Registry,
    state: Arc<WsState>,
    request: Mutex<HttpRequest>,
    decoder: Mutex<FrameDecoder>,
}

impl SessionAdapter {
    fn session(&self, tcp: &TcpSession) -> WsSession {
        WsSession {
            tcp: tcp.clone(),
            state: Arc::clone(&self.state),
        }
    }

    async fn upgrade(&self, session: &WsSession, request: &HttpRequest) {
        match perform_server_upgrade(request) {
            ServerUpgrade::NotWebSocket => {
                self.handler.on_received_request(session, request).await;
            }
            ServerUpgrade::Invalid(response) => {
                session.tcp.send_async(response.cache());
                self.handler
                    .on_ws_error(session, "invalid WebSocket upgrade request")
                    .await;
                self.state.closing.store(true, Ordering::Release);
            }
            ServerUpgrade::Accepted(mut response) => {
                if !self
                    .handler
                    .on_ws_connecting(session, request, &mut response)
                    .await
                {
                    session.tcp.disconnect();
                    return;
                }
                session.tcp.send_async(response.cache());
                self.state.handshaked.store(true, Ordering::Release);
                self.registry.write().insert(session.id(), session.clone());
                debug!(session = %session.id(), "WebSocket handshaked");
                self.handler.on_ws_connected(session, request).await;
            }
        }
    }

    async fn dispatch(&self, session: &WsSession, frame: WsFrame) {
        match frame.opcode {
            Opcode::Ping => {
                self.handler.on_ws_ping(session, &frame.payload).await;
                session.send_pong_async(&frame.payload);
            }
            Opcode::Pong => {
                self.handler.on_ws_pong(session, &frame.payload).await;
            }
            Opcode::Close => {
                let status = frame.close_status().unwrap_or(1000);
                self.handler
                    .on_ws_close(session, status, frame.close_reason())
                    .await;
                if !self.state.closing.swap(true, Ordering::AcqRel) {
                    let mut reply = Vec::new();
                    encode_close_frame(1000, b"", None, &mut reply);
                    if !session.tcp.send_async(&reply) {
                        session.tcp.disconnect();
                    }
                }
            }
            opcode => {
                self.handler
                    .on_ws_received(session, opcode, &frame.payload)
                    .await;
            }
        }
    }
}

#[async_trait]
impl TcpSessionHandler for SessionAdapter {
    async fn on_received(&self, tcp: &TcpSession, buffer: &[u8]) -> usize {
        let session = self.session(tcp);

        if !self.state.handshaked.load(Ordering::Acquire) {
            let completed = {
                let mut request = self.request.lock();
                if request.is_pending_header() {
                    request.receive_header(buffer);
                } else {
                    request.receive_body(buffer);
                }
                if request.is_error() {
                    Some(Err(()))
                } else if request.is_ready() {
                    Some(Ok(std::mem::take(&mut *request)))
                } else {
                    None
                }
            };
            match completed {
                Some(Ok(request)) => self.upgrade(&session, &request).await,
                Some(Err(())) => {
                    self.handler
                        .on_ws_error(&session, "invalid HTTP request")
                        .await;
                    session.tcp.disconnect();
                }
                None => {}
            }
            return buffer.len();
        }

        let frames = self.decoder.lock().feed(buffer);
        for frame in frames {
            self.dispatch(&session, frame).await;
        }
        buffer.len()
    }

    async fn on_empty(&self, tcp: &TcpSession) {
        if self.state.closing.load(Ordering::Acquire) {
            tcp.disconnect();
        }
    }

    async fn on_disconnected(&self, tcp: &TcpSession) {
        self.registry.write().remove(&tcp.id());
        let session = self.session(tcp);
        self.handler.on_disconnected(&session).await;
    }

    fn on_error(&self, _session: &TcpSession, error: &Error) {
        self.handler.on_error(error);
    }
}

/// Plain WebSocket server. Cloning is cheap and shares the server.
#[derive(Clone)]
pub struct WsServer {
    tcp: TcpServer,
    handler: Arc<Mutex<Arc<dyn WsServerHandler>>>,
    registry: Registry,
}

impl WsServer {
    /// Create a server bound to `address` once started.
    #[must_use]
    pub fn new(service: &Service, address: SocketAddr) -> Self {
        Self {
            tcp: TcpServer::new(service, address),
            handler: Arc::new(Mutex::new(Arc::new(NullWsServerHandler))),
            registry: Arc::new(RwLock::new(HashMap::new())),
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

    /// Install the server handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn WsServerHandler>) {
        *self.handler.lock() = handler;
    }

    /// Replace the endpoint options applied at `start` and on accept.
    pub fn set_options(&self, options: EndpointOptions) {
        self.tcp.set_options(options);
    }

    /// Whether the acceptor is running.
    pub fn is_started(&self) -> bool {
        self.tcp.is_started()
    }

    /// The actual bound address, once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.tcp.bound_address()
    }

    /// Number of sessions that completed the WebSocket handshake.
    pub fn handshaked_sessions(&self) -> usize {
        self.registry.read().len()
    }

    /// Number of transport sessions (including ones still upgrading).
    pub fn connected_sessions(&self) -> usize {
        self.tcp.connected_sessions()
    }

    /// Aggregate transfer statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.tcp.stats()
    }

    /// Bind, listen and accept WebSocket sessions.
    pub fn start(&self) -> Result<()> {
        self.tcp.set_handler(Arc::new(ServerAdapter {
            handler: Arc::clone(&self.handler.lock()),
            registry: Arc::clone(&self.registry),
        }));
        self.tcp.start()
    }

    /// Close the acceptor and disconnect every session.
    pub fn stop(&self) -> bool {
        self.tcp.stop()
    }

    /// Build one unmasked text frame and push it to every handshaked
    /// session.
    pub fn multicast_text(&self, text: &[u8]) -> bool {
        self.multicast_frame(Opcode::Text, text)
    }

    /// Build one unmasked binary frame and push it to every handshaked
    /// session.
    pub fn multicast_binary(&self, data: &[u8]) -> bool {
        self.multicast_frame(Opcode::Binary, data)
    }

    /// Send a close frame to every handshaked session and disconnect them.
    pub fn close_all(&self, status: u16) -> bool {
        let sessions: Vec<WsSession> = self.registry.read().values().cloned().collect();
        for session in sessions {
            session.close(status);
        }
        true
    }

    fn multicast_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        let mut frame = Vec::with_capacity(payload.len() + 10);
        encode_frame(opcode, None, payload, &mut frame);
        // Only handshaked sessions may see frame bytes; a connection still
        // in its HTTP-upgrade phase would have its handshake corrupted.
        for session in self.registry.read().values() {
            if session.is_ws_handshaked() {
                session.transport().send_async(&frame);
            }
        }
        true
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("id", &self.id())
            .field("started", &self.is_started())
            .field("handshaked_sessions", &self.handshaked_sessions())
            .finish()
    }
}
