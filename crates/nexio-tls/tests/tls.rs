//! End-to-end TLS scenario: handshake both sides, echo, clean teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use nexio_core::{EndpointOptions, Service};
use nexio_tls::rustls::pki_types::PrivateKeyDer;
use nexio_tls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use nexio_tls::{
    TlsClient, TlsClientHandler, TlsContext, TlsServer, TlsServerHandler, TlsSession,
    TlsSessionHandler,
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

/// Self-signed certificate for `localhost`, trusted by the client config.
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

struct EchoSession;

#[async_trait]
impl TlsSessionHandler for EchoSession {
    async fn on_received(&self, session: &TlsSession, buffer: &[u8]) -> usize {
        session.send_async(buffer);
        buffer.len()
    }
}

#[derive(Default)]
struct EchoServer {
    handshaked: AtomicUsize,
}

#[async_trait]
impl TlsServerHandler for EchoServer {
    fn create_session(&self, _session: &TlsSession) -> Arc<dyn TlsSessionHandler> {
        Arc::new(EchoSession)
    }
    async fn on_handshaked(&self, _session: &TlsSession) {
        self.handshaked.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ClientProbe {
    handshaked: AtomicBool,
    received: AtomicUsize,
}

#[async_trait]
impl TlsClientHandler for ClientProbe {
    async fn on_handshaked(&self, _client: &TlsClient) {
        self.handshaked.store(true, Ordering::Relaxed);
    }
    async fn on_received(&self, _client: &TlsClient, buffer: &[u8]) -> usize {
        self.received.fetch_add(buffer.len(), Ordering::Relaxed);
        buffer.len()
    }
}

#[test]
fn tls_handshake_and_echo() {
    let service = Service::new();
    assert!(service.start());

    let context = test_context();
    let server = TlsServer::new(&service, "127.0.0.1:0".parse().unwrap(), &context).unwrap();
    server.set_options(EndpointOptions::new().reuse_address(true).no_delay(true));
    let server_probe = Arc::new(EchoServer::default());
    server.set_handler(server_probe.clone());
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = TlsClient::new(&service, address, &context).unwrap();
    client.set_server_name("localhost");
    let probe = Arc::new(ClientProbe::default());
    client.set_handler(probe.clone());

    // Synchronous connect returns only after the handshake completed.
    client.connect().unwrap();
    assert!(client.is_handshaked());
    assert!(probe.handshaked.load(Ordering::Relaxed));
    assert!(wait_until(|| server_probe.handshaked.load(Ordering::Relaxed) == 1));

    // No bytes may flow before both endpoints report handshaked; now echo.
    let sent = client.send(b"test").unwrap();
    assert_eq!(sent, 4);
    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) == 4));
    assert!(wait_until(|| {
        let stats = server.stats();
        stats.bytes_received == 4 && stats.bytes_sent == 4
    }));

    // Client disconnect drops the server's session count to zero.
    client.disconnect().unwrap();
    assert!(wait_until(|| server.connected_sessions() == 0));

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn tls_context_without_server_half_fails() {
    let service = Service::new();
    assert!(service.start());

    let context = TlsContext::default();
    assert!(TlsServer::new(&service, "127.0.0.1:0".parse().unwrap(), &context).is_err());
    assert!(TlsClient::new(&service, "127.0.0.1:1".parse().unwrap(), &context).is_err());

    assert!(service.stop());
}
