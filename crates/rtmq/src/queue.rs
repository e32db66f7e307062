// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded queues for cross-thread message handoff.
//!
//! Two variants share one contract ([`MsgQueue`]):
//!
//! - [`BoundedQueue`] — multi-writer/multi-reader, mutex-guarded ring.
//!   Used between the receiver pool and the worker pool, and as the
//!   proxy's shared application send queue.
//! - [`SpscRing`] — single-writer/single-reader lock-free ring on atomic
//!   head/tail indices. Used where exactly one thread feeds exactly one
//!   drainer (a proxy link thread feeding its worker).
//!
//! Both are backed by a [`BlockPool`] of `capacity` pre-allocated blocks
//! of `unit_size` bytes: a message body is copied once from the network
//! buffer into a pool block, and the block is returned only when the
//! consumer releases it.
//!
//! `try_push` failing is not an error; it is the system's sole
//! backpressure signal. Callers count it as a drop and may fire an
//! out-of-band drain notification instead of retrying.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::frame::FrameHeader;

/// One fully-framed message handed between threads.
#[derive(Debug)]
pub struct RecvItem {
    /// Validated frame header.
    pub header: FrameHeader,
    /// Body bytes, living in a pool block (`capacity == unit_size`).
    pub body: Vec<u8>,
}

// ============================================================================
// Block pool
// ============================================================================

/// Fixed pool of `capacity` recycled body blocks of `unit_size` bytes.
///
/// The in-flight block count never exceeds `capacity`; `alloc` failing
/// is backpressure, not an error.
#[derive(Debug)]
pub struct BlockPool {
    free: ArrayQueue<Vec<u8>>,
    unit_size: usize,
}

impl BlockPool {
    /// Pre-allocate `capacity` blocks of `unit_size` bytes each.
    pub fn new(capacity: usize, unit_size: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Freshly built queue of matching capacity; push cannot fail.
            let _ = free.push(Vec::with_capacity(unit_size));
        }
        Self { free, unit_size }
    }

    /// Claim an empty block, or `None` when all are in flight.
    pub fn alloc(&self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    /// Return a block to the pool. Contents are discarded.
    pub fn free(&self, mut block: Vec<u8>) {
        block.clear();
        let _ = self.free.push(block);
    }

    /// Block size this pool hands out.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Blocks currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

// ============================================================================
// Queue contract
// ============================================================================

/// Common surface of both queue variants.
pub trait MsgQueue: Send + Sync {
    /// Non-blocking push; the item comes back on a full queue.
    fn try_push(&self, item: RecvItem) -> Result<(), RecvItem>;

    /// Non-blocking pop.
    fn try_pop(&self) -> Option<RecvItem>;

    /// Best-effort batch drain of up to `max` items into `out`;
    /// returns the number drained. Trades cross-queue ordering for
    /// amortized synchronization.
    fn multi_pop(&self, max: usize, out: &mut Vec<RecvItem>) -> usize;

    /// Items currently queued.
    fn len(&self) -> usize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    fn capacity(&self) -> usize;

    /// Claim a body block from the companion pool.
    fn alloc_block(&self) -> Option<Vec<u8>>;

    /// Release a consumed body block back to the companion pool.
    fn release(&self, block: Vec<u8>);
}

// ============================================================================
// Locked multi-writer/multi-reader variant
// ============================================================================

/// Mutex-guarded bounded ring with a companion block pool.
#[derive(Debug)]
pub struct BoundedQueue {
    ring: Mutex<VecDeque<RecvItem>>,
    capacity: usize,
    pool: BlockPool,
}

impl BoundedQueue {
    /// Ring of `capacity` slots over blocks of `unit_size` bytes.
    pub fn new(capacity: usize, unit_size: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pool: BlockPool::new(capacity, unit_size),
        }
    }
}

impl MsgQueue for BoundedQueue {
    fn try_push(&self, item: RecvItem) -> Result<(), RecvItem> {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            return Err(item);
        }
        ring.push_back(item);
        Ok(())
    }

    fn try_pop(&self) -> Option<RecvItem> {
        self.ring.lock().pop_front()
    }

    fn multi_pop(&self, max: usize, out: &mut Vec<RecvItem>) -> usize {
        let mut ring = self.ring.lock();
        let take = max.min(ring.len());
        out.extend(ring.drain(..take));
        take
    }

    fn len(&self) -> usize {
        self.ring.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn alloc_block(&self) -> Option<Vec<u8>> {
        self.pool.alloc()
    }

    fn release(&self, block: Vec<u8>) {
        self.pool.free(block);
    }
}

// ============================================================================
// Lock-free single-writer/single-reader variant
// ============================================================================

/// SPSC ring: atomic head (producer) and tail (consumer) over fixed
/// slots, one slot kept empty to distinguish full from empty.
///
/// SAFETY contract: exactly one thread may call `try_push` and exactly
/// one thread may call `try_pop`/`multi_pop` over the ring's lifetime.
/// Release/Acquire pairs on the indices publish slot contents.
pub struct SpscRing {
    slots: Box<[UnsafeCell<Option<RecvItem>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    pool: BlockPool,
}

// Slot access is serialized by the SPSC index protocol.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    /// Ring of exactly `capacity` usable slots over blocks of
    /// `unit_size` bytes.
    pub fn new(capacity: usize, unit_size: usize) -> Self {
        let slots: Vec<UnsafeCell<Option<RecvItem>>> =
            (0..capacity + 1).map(|_| UnsafeCell::new(None)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            pool: BlockPool::new(capacity, unit_size),
        }
    }

    fn next(&self, idx: usize) -> usize {
        let n = idx + 1;
        if n == self.slots.len() {
            0
        } else {
            n
        }
    }
}

impl MsgQueue for SpscRing {
    fn try_push(&self, item: RecvItem) -> Result<(), RecvItem> {
        let head = self.head.load(Ordering::Relaxed);
        let next = self.next(head);
        if next == self.tail.load(Ordering::Acquire) {
            return Err(item); // full
        }
        // SAFETY: producer-exclusive slot; consumer will not read it
        // until the Release store below makes it visible.
        unsafe {
            *self.slots[head].get() = Some(item);
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    fn try_pop(&self) -> Option<RecvItem> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None; // empty
        }
        // SAFETY: consumer-exclusive slot; the Acquire load above
        // synchronized with the producer's Release store.
        let item = unsafe { (*self.slots[tail].get()).take() };
        self.tail.store(self.next(tail), Ordering::Release);
        item
    }

    fn multi_pop(&self, max: usize, out: &mut Vec<RecvItem>) -> usize {
        let mut n = 0;
        while n < max {
            match self.try_pop() {
                Some(item) => {
                    out.push(item);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            head + self.slots.len() - tail
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    fn alloc_block(&self) -> Option<Vec<u8>> {
        self.pool.alloc()
    }

    fn release(&self, block: Vec<u8>) {
        self.pool.free(block);
    }
}

impl std::fmt::Debug for SpscRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use std::sync::Arc;

    fn item(tag: u8) -> RecvItem {
        RecvItem {
            header: FrameHeader::application(1, 1, 1),
            body: vec![tag],
        }
    }

    fn check_capacity_invariant(q: &dyn MsgQueue, cap: usize) {
        for i in 0..cap {
            assert!(q.try_push(item(i as u8)).is_ok(), "push {} failed", i);
        }
        // C+1th push fails.
        assert!(q.try_push(item(0xFF)).is_err());
        // After any pop, one more push succeeds.
        assert!(q.try_pop().is_some());
        assert!(q.try_push(item(0xFE)).is_ok());
        assert!(q.try_push(item(0xFD)).is_err());
    }

    #[test]
    fn test_bounded_queue_capacity_invariant() {
        let q = BoundedQueue::new(8, 64);
        check_capacity_invariant(&q, 8);
    }

    #[test]
    fn test_spsc_ring_capacity_invariant() {
        let q = SpscRing::new(8, 64);
        check_capacity_invariant(&q, 8);
    }

    #[test]
    fn test_fifo_order_within_queue() {
        let q = BoundedQueue::new(4, 64);
        for i in 0..4 {
            q.try_push(item(i)).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.try_pop().unwrap().body, vec![i]);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_multi_pop_batch() {
        let q = BoundedQueue::new(16, 64);
        for i in 0..10 {
            q.try_push(item(i)).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(q.multi_pop(4, &mut out), 4);
        assert_eq!(q.multi_pop(100, &mut out), 6);
        assert_eq!(q.multi_pop(1, &mut out), 0);
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].body, vec![0]);
        assert_eq!(out[9].body, vec![9]);
    }

    #[test]
    fn test_block_pool_exhaustion_and_recycle() {
        let pool = BlockPool::new(2, 32);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());

        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c.capacity(), 32);
        assert!(c.is_empty());
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_spsc_ring_cross_thread() {
        let q = Arc::new(SpscRing::new(64, 16));
        let producer_q = Arc::clone(&q);

        let producer = std::thread::spawn(move || {
            let mut pushed = 0u32;
            while pushed < 1000 {
                if producer_q.try_push(item((pushed % 251) as u8)).is_ok() {
                    pushed += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut popped = 0u32;
        let mut out = Vec::new();
        while popped < 1000 {
            let n = q.multi_pop(32, &mut out);
            if n == 0 {
                std::hint::spin_loop();
                continue;
            }
            for (i, it) in out.drain(..).enumerate() {
                assert_eq!(it.body, vec![((popped as usize + i) % 251) as u8]);
            }
            popped += n as u32;
        }
        producer.join().unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_bounded_queue_concurrent_producers() {
        let q = Arc::new(BoundedQueue::new(1024, 16));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    while q.try_push(item(i as u8)).is_err() {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 800);
    }
}
