//! Socket option plumbing shared with the TLS transport.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use nexio_core::EndpointOptions;

/// Listen backlog for acceptors.
const LISTEN_BACKLOG: i32 = 1024;

/// Build a listening socket with the configured acceptor options and hand
/// it to the runtime behind `handle`.
pub fn build_listener(
    address: SocketAddr,
    options: &EndpointOptions,
    handle: &Handle,
) -> io::Result<TcpListener> {
    let domain = Domain::for_address(address);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    let _guard = handle.enter();
    TcpListener::from_std(listener)
}

/// Apply per-connection options to an accepted or connected stream and
/// report the effective OS `(receive, send)` buffer sizes, which size the
/// endpoint's own buffers.
pub fn apply_stream_options(
    stream: &TcpStream,
    options: &EndpointOptions,
) -> io::Result<(usize, usize)> {
    stream.set_nodelay(options.no_delay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(options.keep_alive)?;
    if let Some(size) = options.receive_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    let receive = sock.recv_buffer_size()?;
    let send = sock.send_buffer_size()?;
    Ok((receive, send))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_listener_with_reuse() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let options = EndpointOptions::new().reuse_address(true);
        let listener = build_listener(
            "127.0.0.1:0".parse().unwrap(),
            &options,
            runtime.handle(),
        )
        .unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }
}
