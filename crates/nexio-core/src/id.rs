//! Endpoint identity.

use std::fmt;

use uuid::Uuid;

/// Stable 128-bit identifier assigned to every endpoint at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The raw 16 identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The identifier as a `Uuid`.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), 16);
    }
}
