// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane commands and per-thread handles.
//!
//! Every long-lived thread owns an mpsc receiver for typed commands,
//! paired with a wake primitive matched to how that thread sleeps:
//! receivers park in `mio::Poll::poll` and are woken by a
//! [`mio::Waker`]; workers park on a [`WakeNotifier`] condvar. A
//! handle bundles the sender with the right waker so a command is
//! always seen promptly.

use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::wake::WakeNotifier;

/// Typed control messages between threads.
#[derive(Debug)]
pub enum Command {
    /// Listener hands an accepted socket to a receiver.
    AddConnection {
        stream: mio::net::TcpStream,
        serial: u64,
        peer: SocketAddr,
    },
    /// A receiver queue has pending items (`count` is best-effort).
    ProcessQueue {
        rsvr_id: usize,
        queue_idx: usize,
        count: usize,
    },
    /// A receiver's distribution queue holds outbound frames.
    DistributePending,
    /// Stop the thread after draining in-flight commands.
    Shutdown,
}

/// One outbound frame routed toward a node, already wire-encoded.
#[derive(Debug)]
pub struct DistItem {
    pub node: i32,
    pub frame: Vec<u8>,
}

/// Sender half of a receiver's command channel, paired with its poll
/// waker.
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    cmd_tx: Sender<Command>,
    waker: Arc<mio::Waker>,
}

impl ReceiverHandle {
    pub fn new(cmd_tx: Sender<Command>, waker: Arc<mio::Waker>) -> Self {
        Self { cmd_tx, waker }
    }

    /// Deliver a command and interrupt the receiver's poll.
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ChannelClosed)?;
        self.waker.wake().map_err(Error::Io)
    }

    /// Poke the poll loop without queueing a command.
    pub fn wake(&self) -> Result<()> {
        self.waker.wake().map_err(Error::Io)
    }
}

/// Sender half of a worker's command channel, paired with its condvar
/// notifier.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    cmd_tx: Sender<Command>,
    notifier: Arc<WakeNotifier>,
}

impl WorkerHandle {
    pub fn new(cmd_tx: Sender<Command>, notifier: Arc<WakeNotifier>) -> Self {
        Self { cmd_tx, notifier }
    }

    /// Deliver a command and wake the worker.
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ChannelClosed)?;
        self.notifier.notify();
        Ok(())
    }

    /// Wake the worker so it re-scans its queues.
    pub fn notify(&self) {
        self.notifier.notify();
    }
}
