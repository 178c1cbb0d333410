//! End-to-end UDP scenarios: unicast echo and multicast group membership.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use nexio_core::{EndpointOptions, Service};
use nexio_udp::{UdpClient, UdpClientHandler, UdpServer, UdpServerHandler};

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

struct EchoServer;

#[async_trait]
impl UdpServerHandler for EchoServer {
    async fn on_received(&self, server: &UdpServer, peer: SocketAddr, data: &[u8]) {
        server.send_async(peer, data);
    }
}

#[derive(Default)]
struct ClientProbe {
    received: AtomicUsize,
    datagrams: AtomicUsize,
}

#[async_trait]
impl UdpClientHandler for ClientProbe {
    async fn on_received(&self, _client: &UdpClient, _peer: SocketAddr, data: &[u8]) {
        self.received.fetch_add(data.len(), Ordering::Relaxed);
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn udp_echo() {
    let service = Service::new();
    assert!(service.start());

    let server = UdpServer::new(&service, "127.0.0.1:0".parse().unwrap());
    server.set_handler(Arc::new(EchoServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = UdpClient::new(&service, address);
    let probe = Arc::new(ClientProbe::default());
    client.set_handler(probe.clone());
    assert!(client.connect_async());
    assert!(wait_until(|| client.is_connected()));

    let sent = client.send(b"test").unwrap();
    assert_eq!(sent, 4);

    assert!(wait_until(|| probe.received.load(Ordering::Relaxed) == 4));
    let stats = client.stats();
    assert_eq!(stats.datagrams_sent, 1);
    assert_eq!(stats.datagrams_received, 1);
    assert!(wait_until(|| {
        let stats = server.stats();
        stats.datagrams_received == 1 && stats.datagrams_sent == 1
    }));

    assert!(client.disconnect());
    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn udp_multicast() {
    let service = Service::new();
    assert!(service.start());

    // Pick a port for the group by binding an ephemeral probe socket.
    let port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let group_ip: std::net::IpAddr = "239.255.0.1".parse().unwrap();
    let group: SocketAddr = format!("239.255.0.1:{port}").parse().unwrap();

    let server = UdpServer::new(&service, "0.0.0.0:0".parse().unwrap());
    server.set_options(EndpointOptions::new().multicast(true));
    server.start_multicast(group).unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let client = UdpClient::new(&service, group);
        client.set_options(EndpointOptions::new().multicast(true));
        let probe = Arc::new(ClientProbe::default());
        client.set_handler(probe.clone());
        assert!(client.connect_async());
        assert!(wait_until(|| client.is_connected()));
        if client.join_multicast_group(group_ip).is_err() {
            // The environment offers no multicast routing; nothing to test.
            eprintln!("skipping udp_multicast: group join unsupported");
            assert!(server.stop());
            assert!(service.stop());
            return;
        }
        clients.push((client, probe));
    }

    // Everyone joined sees the datagram.
    assert!(server.multicast(b"test"));
    let all_received = wait_until(|| {
        clients
            .iter()
            .all(|(_, probe)| probe.received.load(Ordering::Relaxed) >= 4)
    });
    if !all_received {
        // Multicast loopback may be filtered in constrained environments.
        eprintln!("skipping udp_multicast: no loopback delivery");
        assert!(server.stop());
        assert!(service.stop());
        return;
    }

    // A client that leaves and closes no longer receives.
    let (leaver, leaver_probe) = clients.pop().unwrap();
    leaver.leave_multicast_group(group_ip).unwrap();
    assert!(leaver.disconnect());
    let baseline = leaver_probe.datagrams.load(Ordering::Relaxed);

    let (stayer, stayer_probe) = clients.pop().unwrap();
    let before = stayer_probe.datagrams.load(Ordering::Relaxed);
    assert!(server.multicast(b"test"));
    assert!(wait_until(|| {
        stayer_probe.datagrams.load(Ordering::Relaxed) > before
    }));
    assert_eq!(leaver_probe.datagrams.load(Ordering::Relaxed), baseline);

    assert!(stayer.disconnect());
    assert!(server.stop());
    assert!(service.stop());
}
