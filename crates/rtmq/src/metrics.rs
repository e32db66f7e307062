// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-thread counters, shared as `Arc` atomics.
//!
//! Counters are written with relaxed ordering on the hot path and read
//! by the admin surface as point-in-time snapshots. No aggregation
//! thread: the snapshot walks the live atomics directly.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ListenerMetrics {
    accepted: AtomicU64,
}

impl ListenerMetrics {
    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    connections: AtomicU64,
    recv_total: AtomicU64,
    err_total: AtomicU64,
    drop_total: AtomicU64,
}

impl ReceiverMetrics {
    pub fn record_conn_open(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conn_close(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_err(&self) {
        self.err_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drop_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            recv_total: self.recv_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverSnapshot {
    pub connections: u64,
    pub recv_total: u64,
    pub err_total: u64,
    pub drop_total: u64,
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    proc_total: AtomicU64,
    drop_total: AtomicU64,
    err_total: AtomicU64,
}

impl WorkerMetrics {
    pub fn record_proc(&self) {
        self.proc_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drop_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_err(&self) {
        self.err_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            proc_total: self.proc_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub proc_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
}

#[derive(Debug, Default)]
pub struct ProxyMetrics {
    sent: AtomicU64,
    send_drops: AtomicU64,
    reconnects: AtomicU64,
    recv_total: AtomicU64,
    recv_drops: AtomicU64,
}

impl ProxyMetrics {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_drop(&self) {
        self.send_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv_drop(&self) {
        self.recv_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_drops: self.send_drops.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            recv_total: self.recv_total.load(Ordering::Relaxed),
            recv_drops: self.recv_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxySnapshot {
    pub sent: u64,
    pub send_drops: u64,
    pub reconnects: u64,
    pub recv_total: u64,
    pub recv_drops: u64,
}

/// Point-in-time view over the whole server.
#[derive(Debug, Clone, Default)]
pub struct AdminSnapshot {
    pub accepted: u64,
    pub receivers: Vec<ReceiverSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}

impl AdminSnapshot {
    pub fn connections(&self) -> u64 {
        self.receivers.iter().map(|r| r.connections).sum()
    }

    pub fn recv_total(&self) -> u64 {
        self.receivers.iter().map(|r| r.recv_total).sum()
    }

    pub fn recv_drops(&self) -> u64 {
        self.receivers.iter().map(|r| r.drop_total).sum()
    }

    pub fn proc_total(&self) -> u64 {
        self.workers.iter().map(|w| w.proc_total).sum()
    }

    pub fn worker_drops(&self) -> u64 {
        self.workers.iter().map(|w| w.drop_total).sum()
    }
}
