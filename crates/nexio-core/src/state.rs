//! Endpoint connection state machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Life-cycle state of a connection-oriented endpoint.
///
/// Transitions are monotone within a single connection epoch:
/// `Disconnected → Connecting → Connected [→ Handshaking → Handshaked]
/// → Disconnecting → Disconnected`. UDP endpoints only use the
/// `Disconnected`/`Connected` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    /// No connection.
    Disconnected = 0,
    /// A connect is in progress.
    Connecting = 1,
    /// The transport connection is established.
    Connected = 2,
    /// The TLS handshake is in progress.
    Handshaking = 3,
    /// The TLS handshake completed.
    Handshaked = 4,
    /// A disconnect is in progress.
    Disconnecting = 5,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Handshaking,
            4 => Self::Handshaked,
            5 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Handshaking => "handshaking",
            Self::Handshaked => "handshaked",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for an [`EndpointState`].
#[derive(Debug)]
pub struct AtomicEndpointState(AtomicU8);

impl AtomicEndpointState {
    /// Create a holder with the given initial state.
    pub fn new(state: EndpointState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state.
    pub fn load(&self) -> EndpointState {
        EndpointState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally enter the given state.
    pub fn store(&self, state: EndpointState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition `from → to`; returns `false` when the current state is not
    /// `from` (the transition is non-reentrant).
    pub fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicEndpointState {
    fn default() -> Self {
        Self::new(EndpointState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_guard() {
        let state = AtomicEndpointState::default();
        assert!(state.transition(EndpointState::Disconnected, EndpointState::Connecting));
        // A second identical transition must fail: not re-entrant.
        assert!(!state.transition(EndpointState::Disconnected, EndpointState::Connecting));
        assert_eq!(state.load(), EndpointState::Connecting);
    }

    #[test]
    fn test_display() {
        assert_eq!(EndpointState::Handshaked.to_string(), "handshaked");
    }
}
