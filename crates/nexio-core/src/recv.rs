//! Growable receive buffer with the doubling policy and limit enforcement.

use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::stats::EndpointStats;

/// Default initial capacity when the OS buffer size is unknown.
pub const DEFAULT_RECEIVE_CAPACITY: usize = 8192;

/// The endpoint-owned receive buffer.
///
/// The reactor appends into spare capacity; the user handler reports how
/// many prefix bytes it consumed and the endpoint erases them. When a read
/// fills the buffer completely its capacity doubles, bounded by the
/// configured limit — growing past the limit is an error that disconnects
/// the endpoint.
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl ReceiveBuffer {
    /// Create a buffer with the given initial capacity and optional limit.
    #[must_use]
    pub fn new(capacity: usize, limit: Option<usize>) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(64)),
            limit,
        }
    }

    /// Unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no unconsumed bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Erase `count` consumed prefix bytes.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.drain(..count);
    }

    /// Drop all content, keeping capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Read once from `reader` into spare capacity, growing first when the
    /// buffer is full. Returns the number of bytes appended (0 on EOF).
    pub async fn read_from<R>(&mut self, reader: &mut R, stats: &EndpointStats) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if self.buf.len() == self.buf.capacity() {
            self.grow()?;
        }
        let received = reader.read_buf(&mut self.buf).await?;
        stats
            .bytes_received
            .fetch_add(received as u64, Ordering::Relaxed);
        Ok(received)
    }

    fn grow(&mut self) -> Result<()> {
        let capacity = self.buf.capacity().max(64);
        if let Some(limit) = self.limit {
            if capacity >= limit {
                return Err(Error::ReceiveBufferLimit { limit });
            }
            let target = (capacity * 2).min(limit);
            self.buf.reserve_exact(target - self.buf.len());
        } else {
            self.buf.reserve_exact(capacity * 2 - self.buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_and_consume() {
        let mut buffer = ReceiveBuffer::new(8, None);
        let stats = EndpointStats::new();
        let mut source: &[u8] = b"test";

        let received = buffer.read_from(&mut source, &stats).await.unwrap();
        assert_eq!(received, 4);
        assert_eq!(buffer.as_slice(), b"test");
        assert_eq!(stats.bytes_received.load(Ordering::Relaxed), 4);

        buffer.consume(2);
        assert_eq!(buffer.as_slice(), b"st");
        buffer.consume(10);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_grows_when_full() {
        let mut buffer = ReceiveBuffer::new(64, None);
        let stats = EndpointStats::new();
        let data = vec![0xAB; 256];
        let mut source: &[u8] = &data;

        let mut total = 0;
        while total < data.len() {
            let received = buffer.read_from(&mut source, &stats).await.unwrap();
            assert!(received > 0);
            total += received;
        }
        assert_eq!(buffer.len(), 256);
        assert!(buffer.capacity() >= 256);
    }

    #[tokio::test]
    async fn test_limit_exceeded_disconnects() {
        let mut buffer = ReceiveBuffer::new(64, Some(64));
        let stats = EndpointStats::new();
        let data = vec![0u8; 128];
        let mut source: &[u8] = &data;

        // First read fills the buffer to its (limited) capacity.
        let received = buffer.read_from(&mut source, &stats).await.unwrap();
        assert_eq!(received, 64);
        // The next read needs growth past the limit.
        let err = buffer.read_from(&mut source, &stats).await.unwrap_err();
        assert!(matches!(err, Error::ReceiveBufferLimit { limit: 64 }));
    }
}
