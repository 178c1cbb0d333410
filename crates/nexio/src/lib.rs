//! nexio: an asynchronous networking framework.
//!
//! A reactor [`Service`] owning a worker pool drives connection-oriented
//! and connectionless endpoints with per-endpoint serialized handlers,
//! explicit receive/send buffer ownership and bounded backpressure:
//!
//! - TCP and TLS servers, sessions and clients ([`TcpServer`],
//!   [`TlsClient`], …)
//! - UDP endpoints with multicast group membership ([`UdpServer`],
//!   [`UdpClient`])
//! - an HTTP/1.1 layer with a zero-copy message model, a static file
//!   cache and future-returning extended clients ([`HttpServer`],
//!   [`HttpClientEx`], …)
//! - an RFC 6455 WebSocket layer over both transports ([`WsServer`],
//!   [`WssClient`], …)
//!
//! ```no_run
//! use nexio::prelude::*;
//!
//! let service = Service::new();
//! service.start();
//!
//! let server = TcpServer::new(&service, "127.0.0.1:1234".parse().unwrap());
//! server.start().unwrap();
//!
//! let client = TcpClient::new(&service, server.bound_address().unwrap());
//! client.connect_async();
//! ```

pub use nexio_core::{
    DefaultServiceHandler, DnsResolver, EndpointId, EndpointOptions, EndpointState, EndpointStats,
    Error, HandlerBuffer, HandlerStorage, ReceiveBuffer, Resolver, Result, SendQueue, Service,
    ServiceConfig, ServiceHandler, StatsSnapshot, Timer, TimerHandler,
};
pub use nexio_http::{
    FileCache, HttpClient, HttpClientEx, HttpClientHandler, HttpRequest, HttpResponse, HttpServer,
    HttpServerHandler, HttpSession, HttpsClient, HttpsClientEx, HttpsClientHandler, HttpsServer,
    HttpsServerHandler, HttpsSession, ResponseFuture,
};
pub use nexio_tcp::{TcpClient, TcpClientHandler, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};
pub use nexio_tls::{
    TlsClient, TlsClientHandler, TlsContext, TlsServer, TlsServerHandler, TlsSession,
    TlsSessionHandler, rustls,
};
pub use nexio_udp::{UdpClient, UdpClientHandler, UdpServer, UdpServerHandler};
pub use nexio_ws::{
    Opcode, WsClient, WsClientHandler, WsFrame, WsServer, WsServerHandler, WsSession, WssClient,
    WssClientHandler, WssServer, WssServerHandler, WssSession,
};

/// The most common imports in one place.
pub mod prelude {
    pub use nexio_core::{
        EndpointId, EndpointOptions, EndpointState, Error, Result, Service, ServiceConfig,
        ServiceHandler, Timer,
    };
    pub use nexio_http::{
        FileCache, HttpClient, HttpClientEx, HttpClientHandler, HttpRequest, HttpResponse,
        HttpServer, HttpServerHandler, HttpSession, HttpsClient, HttpsClientEx, HttpsServer,
        HttpsServerHandler, HttpsSession,
    };
    pub use nexio_tcp::{
        TcpClient, TcpClientHandler, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler,
    };
    pub use nexio_tls::{
        TlsClient, TlsClientHandler, TlsContext, TlsServer, TlsServerHandler, TlsSession,
        TlsSessionHandler,
    };
    pub use nexio_udp::{UdpClient, UdpClientHandler, UdpServer, UdpServerHandler};
    pub use nexio_ws::{
        Opcode, WsClient, WsClientHandler, WsServer, WsServerHandler, WsSession, WssClient,
        WssClientHandler, WssServer, WssServerHandler, WssSession,
    };
}
