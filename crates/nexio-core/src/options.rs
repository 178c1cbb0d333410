//! Per-endpoint configuration surface.

/// Socket and buffer options applied when an endpoint starts or connects.
///
/// The buffer limits are backpressure policies: an endpoint disconnects
/// itself rather than let pending bytes grow past a configured bound. Both
/// default to unlimited.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Enable SO_KEEPALIVE on accepted/connected sockets.
    pub keep_alive: bool,
    /// Disable Nagle's algorithm (TCP_NODELAY).
    pub no_delay: bool,
    /// Enable SO_REUSEADDR on the bound socket.
    pub reuse_address: bool,
    /// Enable SO_REUSEPORT where the platform supports it.
    pub reuse_port: bool,
    /// Bind a UDP endpoint for multicast (implies address reuse so several
    /// listeners can share the local port).
    pub multicast: bool,
    /// Disconnect when the receive buffer would grow past this many bytes.
    pub receive_buffer_limit: Option<usize>,
    /// Disconnect when pending send bytes would exceed this many bytes.
    pub send_buffer_limit: Option<usize>,
    /// OS-level receive buffer size (SO_RCVBUF).
    pub receive_buffer_size: Option<usize>,
    /// OS-level send buffer size (SO_SNDBUF).
    pub send_buffer_size: Option<usize>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            no_delay: false,
            reuse_address: false,
            reuse_port: false,
            multicast: false,
            receive_buffer_limit: None,
            send_buffer_limit: None,
            receive_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl EndpointOptions {
    /// Create the default option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable SO_KEEPALIVE.
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Enable or disable TCP_NODELAY.
    #[must_use]
    pub const fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Enable or disable SO_REUSEADDR.
    #[must_use]
    pub const fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Enable or disable SO_REUSEPORT.
    #[must_use]
    pub const fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Mark a UDP endpoint as a multicast participant.
    #[must_use]
    pub const fn multicast(mut self, enabled: bool) -> Self {
        self.multicast = enabled;
        self
    }

    /// Bound the receive buffer growth.
    #[must_use]
    pub const fn receive_buffer_limit(mut self, limit: usize) -> Self {
        self.receive_buffer_limit = Some(limit);
        self
    }

    /// Bound the pending send bytes.
    #[must_use]
    pub const fn send_buffer_limit(mut self, limit: usize) -> Self {
        self.send_buffer_limit = Some(limit);
        self
    }

    /// Request an OS-level receive buffer size.
    #[must_use]
    pub const fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Request an OS-level send buffer size.
    #[must_use]
    pub const fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let options = EndpointOptions::new()
            .no_delay(true)
            .reuse_address(true)
            .send_buffer_limit(1024);
        assert!(options.no_delay);
        assert!(options.reuse_address);
        assert_eq!(options.send_buffer_limit, Some(1024));
        assert_eq!(options.receive_buffer_limit, None);
    }
}
