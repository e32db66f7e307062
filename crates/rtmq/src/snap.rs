// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sliding-window snapshot buffer.
//!
//! Each connection owns one [`SnapBuffer`] per direction: a fixed
//! allocation with two offsets instead of raw pointers.
//!
//! ```text
//!  |<-------------------- capacity -------------------->|
//!  | consumed  |        window         |   appendable   |
//!   ----------------------------------------------------
//!  |XXXXXXXXXXX|///////////////////////|                |
//!   ----------------------------------------------------
//!  0           consumed               filled        capacity
//! ```
//!
//! The buffer never grows. When a partial trailing frame reaches the
//! end, `compact()` moves the unconsumed tail to index 0 and reclaims
//! the space.

/// Fixed receive/send window over a pre-sized allocation.
#[derive(Debug)]
pub struct SnapBuffer {
    data: Vec<u8>,
    consumed: usize,
    filled: usize,
}

impl SnapBuffer {
    /// Allocate a buffer of exactly `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            consumed: 0,
            filled: 0,
        }
    }

    /// Total allocation size.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unconsumed filled bytes — the region decoders look at.
    pub fn window(&self) -> &[u8] {
        &self.data[self.consumed..self.filled]
    }

    /// Bytes in the window.
    pub fn len(&self) -> usize {
        self.filled - self.consumed
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.consumed == self.filled
    }

    /// Free space at the tail.
    pub fn free(&self) -> usize {
        self.data.len() - self.filled
    }

    /// Mutable free tail: fill it, then call [`advance_filled`].
    ///
    /// [`advance_filled`]: SnapBuffer::advance_filled
    pub fn appendable(&mut self) -> &mut [u8] {
        let filled = self.filled;
        &mut self.data[filled..]
    }

    /// Record `n` bytes written into the appendable region.
    pub fn advance_filled(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len());
        self.filled += n;
    }

    /// Record `n` bytes consumed from the window's front.
    pub fn advance_consumed(&mut self, n: usize) {
        debug_assert!(self.consumed + n <= self.filled);
        self.consumed += n;
        if self.consumed == self.filled {
            self.reset();
        }
    }

    /// Copy as much of `bytes` as fits into the free tail; returns the
    /// number of bytes taken.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free());
        let filled = self.filled;
        self.data[filled..filled + take].copy_from_slice(&bytes[..take]);
        self.filled += take;
        take
    }

    /// Move the unconsumed tail to index 0, reclaiming consumed space.
    pub fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        let len = self.len();
        self.data.copy_within(self.consumed..self.filled, 0);
        self.consumed = 0;
        self.filled = len;
    }

    /// Drop all content.
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.filled = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_consume() {
        let mut snap = SnapBuffer::with_capacity(16);
        assert!(snap.is_empty());
        assert_eq!(snap.free(), 16);

        let n = snap.append(b"hello");
        assert_eq!(n, 5);
        assert_eq!(snap.window(), b"hello");

        snap.advance_consumed(2);
        assert_eq!(snap.window(), b"llo");
    }

    #[test]
    fn test_consume_all_resets() {
        let mut snap = SnapBuffer::with_capacity(8);
        snap.append(b"abcd");
        snap.advance_consumed(4);
        assert!(snap.is_empty());
        assert_eq!(snap.free(), 8);
    }

    #[test]
    fn test_append_truncates_at_capacity() {
        let mut snap = SnapBuffer::with_capacity(4);
        assert_eq!(snap.append(b"abcdef"), 4);
        assert_eq!(snap.window(), b"abcd");
        assert_eq!(snap.append(b"x"), 0);
    }

    #[test]
    fn test_compact_moves_tail_to_front() {
        let mut snap = SnapBuffer::with_capacity(8);
        snap.append(b"abcdefgh");
        snap.advance_consumed(6);
        assert_eq!(snap.free(), 0);

        snap.compact();
        assert_eq!(snap.window(), b"gh");
        assert_eq!(snap.free(), 6);

        snap.append(b"ij");
        assert_eq!(snap.window(), b"ghij");
    }

    #[test]
    fn test_compact_noop_when_nothing_consumed() {
        let mut snap = SnapBuffer::with_capacity(8);
        snap.append(b"abc");
        snap.compact();
        assert_eq!(snap.window(), b"abc");
    }

    #[test]
    fn test_appendable_then_advance() {
        let mut snap = SnapBuffer::with_capacity(8);
        snap.appendable()[..3].copy_from_slice(b"xyz");
        snap.advance_filled(3);
        assert_eq!(snap.window(), b"xyz");
        assert_eq!(snap.appendable().len(), 5);
    }
}
