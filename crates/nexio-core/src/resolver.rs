//! Hostname resolution oracle.
//!
//! The framework treats DNS as an async "hostname → endpoints" oracle;
//! resolver internals stay outside the core.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Asynchronous hostname resolver.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve `host:port` into one or more socket addresses.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// System resolver backed by the runtime's lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addresses.is_empty() {
            return Err(Error::ConnectionFailed(format!(
                "no addresses resolved for {host}:{port}"
            )));
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let resolver = DnsResolver;
        let addresses = resolver.resolve("localhost", 8080).await.unwrap();
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(|addr| addr.port() == 8080));
    }
}
