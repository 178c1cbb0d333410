//! WebSocket (RFC 6455) layer for the nexio networking framework.
//!
//! A hand-rolled single-frame codec (masking, 7/7+16/7+64 length
//! encoding), the section 4 upgrade handshake, and server/session/client
//! endpoints over both the plain TCP and the TLS transports. Extensions
//! and per-message compression are out of scope.

pub mod frame;
pub mod handshake;
pub mod ws_client;
pub mod ws_server;
pub mod wss_client;
pub mod wss_server;

pub use frame::{FrameDecoder, Opcode, WsFrame, encode_close_frame, encode_frame, random_mask};
pub use handshake::{
    ServerUpgrade, WS_GUID, accept_key, make_key, make_upgrade_request, perform_server_upgrade,
    validate_upgrade_response,
};
pub use ws_client::{NullWsClientHandler, WsClient, WsClientHandler};
pub use ws_server::{NullWsServerHandler, WsServer, WsServerHandler, WsSession};
pub use wss_client::{NullWssClientHandler, WssClient, WssClientHandler};
pub use wss_server::{NullWssServerHandler, WssServer, WssServerHandler, WssSession};
