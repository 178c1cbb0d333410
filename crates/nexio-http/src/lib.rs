//! HTTP/1.1 layer for the nexio networking framework.
//!
//! [`HttpRequest`] and [`HttpResponse`] own a single byte cache with range
//! views over it (zero copies after parsing) and double as incremental
//! parsers. Servers and clients exist over both the TCP and TLS
//! transports; GET sessions consult a shared [`FileCache`] of pre-framed
//! responses, and the extended clients add a response-future with timeout
//! per request.

pub mod cache;
pub mod client;
pub mod https_client;
pub mod https_server;
pub mod mime;
mod pipeline;
pub mod request;
pub mod response;
pub mod server;

pub use cache::FileCache;
pub use client::{
    HttpClient, HttpClientEx, HttpClientHandler, NullHttpClientHandler, ResponseFuture,
};
pub use https_client::{HttpsClient, HttpsClientEx, HttpsClientHandler, NullHttpsClientHandler};
pub use https_server::{HttpsServer, HttpsServerHandler, HttpsSession, NullHttpsServerHandler};
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use server::{HttpServer, HttpServerHandler, HttpSession, NullHttpServerHandler};
