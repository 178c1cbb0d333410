//! Datagram socket construction with the configured options.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;

use nexio_core::EndpointOptions;

/// Build a bound datagram socket and hand it to the runtime behind
/// `handle`. A multicast endpoint binds with address reuse so several
/// participants can share the local port.
pub(crate) fn build_socket(
    bind: SocketAddr,
    options: &EndpointOptions,
    handle: &Handle,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(options.reuse_address || options.multicast)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if options.reuse_port || options.multicast {
        socket.set_reuse_port(true)?;
    }
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if options.multicast {
        socket.set_multicast_loop_v4(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;

    let socket: std::net::UdpSocket = socket.into();
    let _guard = handle.enter();
    UdpSocket::from_std(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_multicast_binds_share_a_port() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let options = EndpointOptions::new().multicast(true);
        let first = build_socket("0.0.0.0:0".parse().unwrap(), &options, runtime.handle()).unwrap();
        let port = first.local_addr().unwrap().port();
        let bind: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
        // Address reuse lets a second participant share the same port.
        let second = build_socket(bind, &options, runtime.handle()).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
