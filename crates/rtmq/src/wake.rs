// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Condvar-backed wake notifier for worker threads.
//!
//! Receivers and the control plane push work onto shared queues, then
//! call [`WakeNotifier::notify`] so a parked worker wakes promptly
//! instead of waiting out its poll timeout. The `ready` flag latches a
//! notification delivered while the worker was busy draining, so a
//! wake between `wait_timeout` calls is never lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-to-one wakeup channel between producers and a parked worker.
#[derive(Debug, Default)]
pub struct WakeNotifier {
    ready: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the worker. Safe to call from any thread, any number of
    /// times; extra calls coalesce into one latched wakeup.
    pub fn notify(&self) {
        self.ready.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    /// Park until notified or `timeout` elapses. Returns `true` if a
    /// notification was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // Latched notification from a previous drain pass.
        if self.ready.swap(false, Ordering::AcqRel) {
            return true;
        }
        let mut guard = self.lock.lock();
        // Re-check under the lock so a notify between the swap above
        // and acquiring the lock is not slept through.
        if self.ready.swap(false, Ordering::AcqRel) {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.ready.swap(false, Ordering::AcqRel)
    }
}
