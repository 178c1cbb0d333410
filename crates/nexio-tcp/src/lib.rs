//! TCP transport for the nexio networking framework.
//!
//! A [`TcpServer`] binds, listens and accepts [`TcpSession`]s indefinitely;
//! a [`TcpClient`] mirrors the session with an explicit (re)connect
//! life-cycle. All endpoints carry the shared buffer ownership model: a
//! growable receive buffer consumed by prefix and a double-buffered send
//! queue drained by a writer task under bounded backpressure.

pub mod client;
pub mod server;
pub mod session;
pub mod sockopt;

pub use client::{NullClientHandler, TcpClient, TcpClientHandler};
pub use server::{NullServerHandler, TcpServer, TcpServerHandler};
pub use session::{NullSessionHandler, TcpSession, TcpSessionHandler};
