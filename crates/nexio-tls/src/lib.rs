//! TLS transport for the nexio networking framework.
//!
//! Wraps the TCP endpoints with a pre-handshake step: a shared
//! [`TlsContext`] (prepared rustls configuration) backs any number of
//! [`TlsServer`]s and [`TlsClient`]s, and sessions only deliver data after
//! reaching the `handshaked` state.

pub mod client;
pub mod context;
pub mod server;
pub mod session;

pub use client::{NullTlsClientHandler, TlsClient, TlsClientHandler};
pub use context::TlsContext;
pub use server::{NullTlsServerHandler, TlsServer, TlsServerHandler};
pub use session::{NullTlsSessionHandler, TlsSession, TlsSessionHandler};

// Re-exported so downstream crates build configurations against the same
// rustls version.
pub use tokio_rustls::rustls;
