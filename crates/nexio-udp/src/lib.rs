//! UDP transport for the nexio networking framework.
//!
//! Datagram endpoints with no accept or handshake step: a [`UdpServer`]
//! binds and runs a chunked receive chain, a [`UdpClient`] targets one
//! remote endpoint (or multicast group) with optional group membership.
//! There is no send queue — datagram boundaries preclude coalescing, so
//! every send maps to exactly one datagram and the caller controls rate.

pub mod client;
pub mod server;
mod socket;

pub use client::{NullUdpClientHandler, UdpClient, UdpClientHandler};
pub use server::{NullUdpServerHandler, UdpServer, UdpServerHandler};
