//! Handler scratch storage.
//!
//! One fixed block of memory reused across the async completions of a single
//! I/O slot, so the innermost completion path avoids heap churn. When the
//! block is already in use an allocation falls back to the heap.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

/// Size of the inline scratch block in bytes.
pub const HANDLER_BLOCK_SIZE: usize = 1024;

#[repr(align(1024))]
#[derive(Clone)]
struct Block([u8; HANDLER_BLOCK_SIZE]);

/// A buffer handed out by [`HandlerStorage`]: either the inline block or a
/// heap fallback.
pub struct HandlerBuffer {
    repr: Repr,
}

enum Repr {
    Inline(Box<Block>, usize),
    Heap(Vec<u8>),
}

impl HandlerBuffer {
    /// Whether this buffer came from the inline block.
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline(..))
    }
}

impl Deref for HandlerBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.repr {
            Repr::Inline(block, size) => &block.0[..*size],
            Repr::Heap(vec) => vec,
        }
    }
}

impl DerefMut for HandlerBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.repr {
            Repr::Inline(block, size) => &mut block.0[..*size],
            Repr::Heap(vec) => vec,
        }
    }
}

/// Single-block scratch arena with an in-use flag.
///
/// Not thread-safe: intended for single-completion-at-a-time handler chains
/// on one endpoint's driver task.
pub struct HandlerStorage {
    block: Cell<Option<Box<Block>>>,
}

impl HandlerStorage {
    /// Create storage with a fresh (unused) block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block: Cell::new(Some(Box::new(Block([0; HANDLER_BLOCK_SIZE])))),
        }
    }

    /// Whether the inline block is currently handed out.
    pub fn is_in_use(&self) -> bool {
        let block = self.block.take();
        let in_use = block.is_none();
        self.block.set(block);
        in_use
    }

    /// Allocate a zero-initialized buffer of `size` bytes. Returns the
    /// inline block when it fits and is free, otherwise a heap buffer.
    pub fn allocate(&self, size: usize) -> HandlerBuffer {
        if size <= HANDLER_BLOCK_SIZE {
            if let Some(mut block) = self.block.take() {
                block.0[..size].fill(0);
                return HandlerBuffer {
                    repr: Repr::Inline(block, size),
                };
            }
        }
        HandlerBuffer {
            repr: Repr::Heap(vec![0; size]),
        }
    }

    /// Return a buffer; the inline block becomes available again, heap
    /// buffers are simply dropped.
    pub fn deallocate(&self, buffer: HandlerBuffer) {
        if let Repr::Inline(block, _) = buffer.repr {
            self.block.set(Some(block));
        }
    }
}

impl Default for HandlerStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_then_heap_fallback() {
        let storage = HandlerStorage::new();
        assert!(!storage.is_in_use());

        let first = storage.allocate(128);
        assert!(first.is_inline());
        assert_eq!(first.len(), 128);
        assert!(storage.is_in_use());

        // Reentrant allocation falls back to the heap.
        let second = storage.allocate(128);
        assert!(!second.is_inline());

        storage.deallocate(first);
        assert!(!storage.is_in_use());
        storage.deallocate(second);

        let third = storage.allocate(HANDLER_BLOCK_SIZE);
        assert!(third.is_inline());
    }

    #[test]
    fn test_oversized_goes_to_heap() {
        let storage = HandlerStorage::new();
        let buffer = storage.allocate(HANDLER_BLOCK_SIZE + 1);
        assert!(!buffer.is_inline());
        assert!(!storage.is_in_use());
        assert_eq!(buffer.len(), HANDLER_BLOCK_SIZE + 1);
    }

    #[test]
    fn test_buffer_is_writable() {
        let storage = HandlerStorage::new();
        let mut buffer = storage.allocate(4);
        buffer.copy_from_slice(b"ping");
        assert_eq!(&buffer[..], b"ping");
        storage.deallocate(buffer);
    }
}
