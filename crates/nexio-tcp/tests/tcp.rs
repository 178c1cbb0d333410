//! End-to-end TCP scenarios: echo, broadcast, clean disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use nexio_core::{EndpointOptions, Service};
use nexio_tcp::{
    TcpClient, TcpClientHandler, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler,
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

struct EchoSession;

#[async_trait]
impl TcpSessionHandler for EchoSession {
    async fn on_received(&self, session: &TcpSession, buffer: &[u8]) -> usize {
        session.send_async(buffer);
        buffer.len()
    }
}

struct EchoServer;

impl TcpServerHandler for EchoServer {
    fn create_session(&self, _session: &TcpSession) -> Arc<dyn TcpSessionHandler> {
        Arc::new(EchoSession)
    }
}

#[derive(Default)]
struct ClientProbe {
    received: AtomicUsize,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl TcpClientHandler for ClientProbe {
    async fn on_connected(&self, _client: &TcpClient) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }
    async fn on_disconnected(&self, _client: &TcpClient) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }
    async fn on_received(&self, _client: &TcpClient, buffer: &[u8]) -> usize {
        self.received.fetch_add(buffer.len(), Ordering::Relaxed);
        buffer.len()
    }
}

fn start_echo_server(service: &Service) -> TcpServer {
    let server = TcpServer::new(service, "127.0.0.1:0".parse().unwrap());
    server.set_options(
        EndpointOptions::new()
            .reuse_address(true)
            .no_delay(true),
    );
    server.set_handler(Arc::new(EchoServer));
    server.start().unwrap();
    server
}

#[test]
fn tcp_echo() {
    let service = Service::new();
    assert!(service.start());

    let server = start_echo_server(&service);
    let address = server.bound_address().unwrap();

    let client = TcpClient::new(&service, address);
    let probe = Arc::new(ClientProbe::default());
    client.set_handler(probe.clone());

    assert!(client.connect_async());
    assert!(wait_until(|| client.is_connected()));
    assert!(wait_until(|| server.connected_sessions() == 1));

    let sent = client.send(b"test").unwrap();
    assert_eq!(sent, 4);

    // The server echoes the four bytes back.
    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) == 4));
    assert!(wait_until(|| {
        let stats = server.stats();
        stats.bytes_received == 4 && stats.bytes_sent == 4
    }));
    assert_eq!(client.stats().bytes_sent, 4);
    assert_eq!(client.stats().bytes_received, 4);

    client.disconnect().unwrap();
    assert!(wait_until(|| server.connected_sessions() == 0));
    assert!(wait_until(|| probe.disconnected.load(Ordering::Relaxed) == 1));

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn tcp_broadcast() {
    let service = Service::new();
    assert!(service.start());

    let server = start_echo_server(&service);
    let address = server.bound_address().unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = TcpClient::new(&service, address);
        let probe = Arc::new(ClientProbe::default());
        client.set_handler(probe.clone());
        assert!(client.connect_async());
        clients.push((client, probe));
    }
    assert!(wait_until(|| server.connected_sessions() == 3));

    assert!(server.multicast(b"test"));
    for (_, probe) in &clients {
        assert!(wait_until(|| probe.received.load(Ordering::Relaxed) == 4));
    }
    assert!(wait_until(|| server.stats().bytes_sent == 12));
    assert_eq!(server.stats().bytes_received, 0);

    for (client, _) in &clients {
        client.disconnect().unwrap();
    }
    assert!(wait_until(|| server.connected_sessions() == 0));
    // Departed sessions keep contributing to the aggregate counters.
    assert_eq!(server.stats().bytes_sent, 12);

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn tcp_server_restart() {
    let service = Service::new();
    assert!(service.start());

    let server = start_echo_server(&service);
    let first = server.bound_address().unwrap();

    let client = TcpClient::new(&service, first);
    client.set_handler(Arc::new(ClientProbe::default()));
    assert!(client.connect_async());
    assert!(wait_until(|| server.connected_sessions() == 1));

    // Restart drains the session table before accepting again.
    server.restart().unwrap();
    assert!(server.is_started());
    assert_eq!(server.connected_sessions(), 0);

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn tcp_send_buffer_limit_disconnects() {
    let service = Service::new();
    assert!(service.start());

    let server = start_echo_server(&service);
    let address = server.bound_address().unwrap();

    let client = TcpClient::new(&service, address);
    client.set_options(EndpointOptions::new().send_buffer_limit(8));
    let probe = Arc::new(ClientProbe::default());
    client.set_handler(probe.clone());
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_connected()));

    // One oversized append violates the limit and the endpoint
    // disconnects itself.
    assert!(!client.send_async(&[0u8; 64]));
    assert!(wait_until(|| !client.is_connected()));

    assert!(server.stop());
    assert!(service.stop());
}
