//! TLS context: prepared rustls configuration shared by many endpoints.

use std::sync::Arc;

use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use nexio_core::{Error, Result};

/// Opaque TLS configuration. Certificate chains, private keys, protocol
/// versions and verification modes are prepared by the caller; the context
/// only hands out acceptors and connectors. One context may back many
/// servers and clients and is immutable after construction.
#[derive(Clone, Default)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl TlsContext {
    /// Context for server endpoints.
    #[must_use]
    pub fn with_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            client: None,
        }
    }

    /// Context for client endpoints.
    #[must_use]
    pub fn with_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            server: None,
            client: Some(config),
        }
    }

    /// Context backing both roles.
    #[must_use]
    pub fn with_configs(server: Arc<ServerConfig>, client: Arc<ClientConfig>) -> Self {
        Self {
            server: Some(server),
            client: Some(client),
        }
    }

    /// Whether the context can back a server.
    pub fn supports_server(&self) -> bool {
        self.server.is_some()
    }

    /// Whether the context can back a client.
    pub fn supports_client(&self) -> bool {
        self.client.is_some()
    }

    /// An acceptor for server-side handshakes.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        self.server
            .as_ref()
            .map(|config| TlsAcceptor::from(Arc::clone(config)))
            .ok_or_else(|| Error::Configuration("TLS context has no server configuration".into()))
    }

    /// A connector for client-side handshakes.
    pub fn connector(&self) -> Result<TlsConnector> {
        self.client
            .as_ref()
            .map(|config| TlsConnector::from(Arc::clone(config)))
            .ok_or_else(|| Error::Configuration("TLS context has no client configuration".into()))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_fails_fast() {
        let context = TlsContext::default();
        assert!(context.acceptor().is_err());
        assert!(context.connector().is_err());
    }
}
