//! End-to-end WebSocket scenarios: secure upgrade + echo + close
//! handshake, and a plain-TCP variant.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use nexio_core::{EndpointOptions, Service};
use nexio_http::HttpResponse;
use nexio_tcp::{TcpClient, TcpClientHandler};
use nexio_tls::TlsContext;
use nexio_tls::rustls::pki_types::PrivateKeyDer;
use nexio_tls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use nexio_ws::{
    Opcode, WsClient, WsClientHandler, WsServer, WsServerHandler, WsSession, WssClient,
    WssClientHandler, WssServer, WssServerHandler, WssSession,
};

const STEP: Duration = Duration::from_millis(2);
const DEADLINE: Duration = Duration::from_secs(10);

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(STEP);
    }
    false
}

fn test_context() -> TlsContext {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsContext::with_configs(Arc::new(server), Arc::new(client))
}

struct EchoWssServer;

#[async_trait]
impl WssServerHandler for EchoWssServer {
    async fn on_ws_received(&self, session: &WssSession, opcode: Opcode, data: &[u8]) {
        match opcode {
            Opcode::Text => session.send_text_async(data),
            _ => session.send_binary_async(data),
        };
    }
}

#[derive(Default)]
struct WssProbe {
    ws_connected: AtomicBool,
    closed: AtomicBool,
    disconnected: AtomicBool,
    received: AtomicUsize,
}

#[async_trait]
impl WssClientHandler for WssProbe {
    async fn on_ws_connected(&self, _client: &WssClient, response: &HttpResponse) {
        assert_eq!(response.status(), 101);
        self.ws_connected.store(true, Ordering::Relaxed);
    }
    async fn on_ws_received(&self, _client: &WssClient, opcode: Opcode, data: &[u8]) {
        assert_eq!(opcode, Opcode::Text);
        self.received.fetch_add(data.len(), Ordering::Relaxed);
    }
    async fn on_ws_close(&self, _client: &WssClient, status: u16, _reason: &[u8]) {
        assert_eq!(status, 1000);
        self.closed.store(true, Ordering::Relaxed);
    }
    async fn on_disconnected(&self, _client: &WssClient) {
        self.disconnected.store(true, Ordering::Relaxed);
    }
}

#[test]
fn wss_echo_and_close() {
    let service = Service::new();
    assert!(service.start());

    let context = test_context();
    let server = WssServer::new(&service, "127.0.0.1:0".parse().unwrap(), &context).unwrap();
    server.set_options(EndpointOptions::new().reuse_address(true).no_delay(true));
    server.set_handler(Arc::new(EchoWssServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = WssClient::new(&service, address, &context).unwrap();
    client.set_server_name("localhost");
    client.set_target("/echo");
    let probe = Arc::new(WssProbe::default());
    client.set_handler(probe.clone());

    // TLS handshake, then the RFC 6455 upgrade with the accept-key check
    // (a mismatching Sec-WebSocket-Accept fails the connect).
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_ws_handshaked()));
    assert!(probe.ws_connected.load(Ordering::Relaxed));
    assert!(wait_until(|| server.handshaked_sessions() == 1));

    // Text echo through the secure channel.
    assert!(client.send_text_async(b"test"));
    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) >= 4));
    assert!(client.stats().bytes_received >= 4);

    // Close handshake: our close elicits the server's close reply and
    // both sides disconnect.
    assert!(client.close(1000));
    assert!(wait_until(|| probe.disconnected.load(Ordering::Relaxed)));
    assert!(wait_until(|| server.handshaked_sessions() == 0));
    assert!(!client.is_ws_handshaked());

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn wss_server_initiated_close() {
    let service = Service::new();
    assert!(service.start());

    let context = test_context();
    let server = WssServer::new(&service, "127.0.0.1:0".parse().unwrap(), &context).unwrap();
    server.set_handler(Arc::new(EchoWssServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = WssClient::new(&service, address, &context).unwrap();
    client.set_server_name("localhost");
    let probe = Arc::new(WssProbe::default());
    client.set_handler(probe.clone());
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_ws_handshaked()));

    // The server multicasts a close to everyone.
    server.close_all(1000);
    assert!(wait_until(|| probe.closed.load(Ordering::Relaxed)));
    assert!(wait_until(|| probe.disconnected.load(Ordering::Relaxed)));

    assert!(server.stop());
    assert!(service.stop());
}

struct EchoWsServer;

#[async_trait]
impl WsServerHandler for EchoWsServer {
    async fn on_ws_received(&self, session: &WsSession, _opcode: Opcode, data: &[u8]) {
        session.send_text_async(data);
    }
}

#[derive(Default)]
struct WsProbe {
    received: AtomicUsize,
}

#[async_trait]
impl WsClientHandler for WsProbe {
    async fn on_ws_received(&self, _client: &WsClient, _opcode: Opcode, data: &[u8]) {
        self.received.fetch_add(data.len(), Ordering::Relaxed);
    }
}

/// Counts raw transport bytes, bypassing any WebSocket framing.
#[derive(Default)]
struct RawProbe {
    received: AtomicUsize,
}

#[async_trait]
impl TcpClientHandler for RawProbe {
    async fn on_received(&self, _client: &TcpClient, buffer: &[u8]) -> usize {
        self.received.fetch_add(buffer.len(), Ordering::Relaxed);
        buffer.len()
    }
}

#[test]
fn ws_plain_echo_and_multicast() {
    let service = Service::new();
    assert!(service.start());

    let server = WsServer::new(&service, "127.0.0.1:0".parse().unwrap());
    server.set_options(EndpointOptions::new().reuse_address(true).no_delay(true));
    server.set_handler(Arc::new(EchoWsServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = WsClient::new(&service, address);
    let probe = Arc::new(WsProbe::default());
    client.set_handler(probe.clone());
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_ws_handshaked()));

    assert!(client.send_text_async(b"test"));
    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) >= 4));

    // A server-built frame reaches every handshaked session.
    let before = probe.received.load(Ordering::Relaxed);
    assert!(server.multicast_text(b"news"));
    assert!(wait_until(|| {
        probe.received.load(Ordering::Relaxed) >= before + 4
    }));

    assert!(client.close(1000));
    assert!(wait_until(|| server.handshaked_sessions() == 0));

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn ws_multicast_skips_unupgraded_peers() {
    let service = Service::new();
    assert!(service.start());

    let server = WsServer::new(&service, "127.0.0.1:0".parse().unwrap());
    server.set_options(EndpointOptions::new().reuse_address(true).no_delay(true));
    server.set_handler(Arc::new(EchoWsServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    // One fully upgraded client.
    let client = WsClient::new(&service, address);
    let probe = Arc::new(WsProbe::default());
    client.set_handler(probe.clone());
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_ws_handshaked()));

    // One peer stuck mid-upgrade: TCP accepted, upgrade request
    // incomplete (no header terminator sent).
    let half_open = TcpClient::new(&service, address);
    let half_probe = Arc::new(RawProbe::default());
    half_open.set_handler(half_probe.clone());
    assert!(half_open.connect_async());
    assert!(wait_until(|| half_open.is_connected()));
    assert!(half_open.send_async(b"GET /chat HTTP/1.1\r\nHost: localhost\r\n"));
    assert!(wait_until(|| server.connected_sessions() == 2));
    assert!(wait_until(|| server.handshaked_sessions() == 1));

    assert!(server.multicast_text(b"news"));
    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) >= 4));

    // The handshaked session saw the frame; the peer still in its HTTP
    // phase must not receive a single frame byte, or its handshake would
    // be corrupted.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(half_probe.received.load(Ordering::Relaxed), 0);

    let _ = half_open.disconnect();
    assert!(client.close(1000));
    assert!(wait_until(|| server.handshaked_sessions() == 0));

    assert!(server.stop());
    assert!(service.stop());
}
