// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy client: K link threads plus a local worker pool.
//!
//! Each link thread owns one connection to the server and mirrors the
//! receiver engine over it. The link lifecycle:
//!
//! ```text
//! Disconnected --connect--> Connecting --writable--> Connected
//!      ^                                                |
//!      |   auth reject / corrupt / EOF / probe unacked  |
//!      +-------- fixed reconnect_delay sleep <----------+
//! ```
//!
//! A LinkAuthReq is the first frame on every fresh connection; until
//! the positive LinkAuthRsp arrives the link sends nothing from the
//! shared application queue. System frames always jump that queue via
//! a link-local list.
//!
//! The reconnect delay is a fixed 2 s with no backoff and no attempt
//! limit. Inbound application frames land in per-link SPSC rings (one
//! producer: the link; one consumer: the owning worker).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver as MpscReceiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::command::{Command, ReceiverHandle, WorkerHandle};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::frame::{
    self, sys, DecodeOutcome, FrameHeader, LinkAuthReq, LinkAuthRsp, FLAG_APPLICATION,
    FLAG_SYSTEM,
};
use crate::metrics::{ProxyMetrics, WorkerMetrics};
use crate::queue::{BoundedQueue, MsgQueue, RecvItem, SpscRing};
use crate::registry::HandlerRegistry;
use crate::snap::SnapBuffer;
use crate::wake::WakeNotifier;
use crate::worker::{self, WorkerCtx};

const WAKER_TOKEN: Token = Token(0);
const CONN_TOKEN: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Granularity of the reconnect sleep; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

struct ProxyRuntime {
    links: Vec<ReceiverHandle>,
    link_joins: Vec<JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
    worker_joins: Vec<JoinHandle<()>>,
}

/// Client endpoint of the transport.
pub struct Proxy {
    cfg: Arc<ProxyConfig>,
    registry: Arc<HandlerRegistry>,
    /// Shared application send queue, drained by every link.
    sendq: Arc<BoundedQueue>,
    /// `link_threads * recv_queues` rings, striped per link.
    recv_queues: Vec<Arc<SpscRing>>,
    metrics: Arc<ProxyMetrics>,
    worker_metrics: Vec<Arc<WorkerMetrics>>,
    running: Arc<AtomicBool>,
    runtime: Option<ProxyRuntime>,
}

impl Proxy {
    /// Validate `cfg` and build queues. Threads appear in [`launch`].
    ///
    /// [`launch`]: Proxy::launch
    pub fn new(cfg: ProxyConfig, registry: HandlerRegistry) -> Result<Self> {
        cfg.validate()?;

        let sendq = Arc::new(BoundedQueue::new(
            cfg.send_queue_capacity,
            cfg.queue.unit_size,
        ));
        let recv_queues = (0..cfg.link_threads * cfg.recv_queues)
            .map(|_| Arc::new(SpscRing::new(cfg.queue.capacity, cfg.queue.unit_size)))
            .collect();
        let worker_metrics = (0..cfg.work_threads)
            .map(|_| Arc::new(WorkerMetrics::default()))
            .collect();

        Ok(Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(registry),
            sendq,
            recv_queues,
            metrics: Arc::new(ProxyMetrics::default()),
            worker_metrics,
            running: Arc::new(AtomicBool::new(false)),
            runtime: None,
        })
    }

    /// Spawn the worker pool and the link threads.
    pub fn launch(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::Config("proxy already launched".into()));
        }
        let addr: SocketAddr = self
            .cfg
            .server_addr
            .parse()
            .map_err(|e| Error::Config(format!("bad server address: {}", e)))?;
        self.running.store(true, Ordering::Release);

        let mut workers = Vec::with_capacity(self.cfg.work_threads);
        let mut worker_joins = Vec::with_capacity(self.cfg.work_threads);
        for id in 0..self.cfg.work_threads {
            let notifier = Arc::new(WakeNotifier::new());
            let (cmd_tx, cmd_rx) = mpsc::channel();
            let ctx = WorkerCtx {
                id,
                queues: self
                    .recv_queues
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % self.cfg.work_threads == id)
                    .map(|(i, q)| (i, Arc::clone(q) as Arc<dyn MsgQueue>))
                    .collect(),
                registry: Arc::clone(&self.registry),
                notifier: Arc::clone(&notifier),
                metrics: Arc::clone(&self.worker_metrics[id]),
                running: Arc::clone(&self.running),
                batch: self.cfg.worker_batch,
            };
            worker_joins.push(worker::spawn(&self.cfg.name, ctx, cmd_rx).map_err(Error::Io)?);
            workers.push(WorkerHandle::new(cmd_tx, notifier));
        }

        let mut links = Vec::with_capacity(self.cfg.link_threads);
        let mut link_joins = Vec::with_capacity(self.cfg.link_threads);
        for id in 0..self.cfg.link_threads {
            let poll = Poll::new().map_err(Error::Io)?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);
            let (cmd_tx, cmd_rx) = mpsc::channel();

            let stripe_base = id * self.cfg.recv_queues;
            let link = Link {
                id,
                cfg: Arc::clone(&self.cfg),
                addr,
                sendq: Arc::clone(&self.sendq),
                queues: (0..self.cfg.recv_queues)
                    .map(|j| {
                        let global = stripe_base + j;
                        (global, Arc::clone(&self.recv_queues[global]))
                    })
                    .collect(),
                workers: workers.clone(),
                metrics: Arc::clone(&self.metrics),
                running: Arc::clone(&self.running),
                poll,
                cmd_rx,
            };
            let name = format!("{}-link-{}", self.cfg.name, id);
            link_joins.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || link.run())
                    .map_err(Error::Io)?,
            );
            links.push(ReceiverHandle::new(cmd_tx, waker));
        }

        log::info!(
            "{}: node {} -> {} ({} links, {} work)",
            self.cfg.name,
            self.cfg.node_id,
            addr,
            self.cfg.link_threads,
            self.cfg.work_threads
        );
        self.runtime = Some(ProxyRuntime {
            links,
            link_joins,
            workers,
            worker_joins,
        });
        Ok(())
    }

    /// Queue one application frame toward the server.
    ///
    /// Fails fast on a full queue; past that it is fire-and-forget
    /// (a link picks it up whenever one is authenticated).
    pub fn send(&self, msg_type: u16, payload: &[u8]) -> Result<()> {
        let rt = self.runtime.as_ref().ok_or(Error::NotConnected)?;
        if msg_type >= self.cfg.type_max {
            return Err(Error::InvalidType(msg_type));
        }
        if payload.len() > self.cfg.max_body_size {
            return Err(Error::TooLong(payload.len()));
        }

        let Some(mut block) = self.sendq.alloc_block() else {
            self.metrics.record_send_drop();
            return Err(Error::QueueFull);
        };
        block.extend_from_slice(payload);
        let item = RecvItem {
            header: FrameHeader::application(msg_type, self.cfg.node_id, payload.len() as u32),
            body: block,
        };
        if let Err(item) = self.sendq.try_push(item) {
            self.sendq.release(item.body);
            self.metrics.record_send_drop();
            return Err(Error::QueueFull);
        }
        self.metrics.record_sent();

        for link in &rt.links {
            let _ = link.wake();
        }
        Ok(())
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Stop links and workers and join them. Queued-but-unsent
    /// messages are discarded.
    pub fn shutdown(&mut self) {
        let Some(mut rt) = self.runtime.take() else {
            return;
        };
        log::info!("{}: shutting down", self.cfg.name);
        self.running.store(false, Ordering::Release);

        for handle in &rt.links {
            let _ = handle.send(Command::Shutdown);
        }
        for handle in &rt.workers {
            let _ = handle.send(Command::Shutdown);
        }
        for join in rt.link_joins.drain(..) {
            let _ = join.join();
        }
        for join in rt.worker_joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------
// Link thread
// ----------------------------------------------------------------------

struct Link {
    id: usize,
    cfg: Arc<ProxyConfig>,
    addr: SocketAddr,
    sendq: Arc<BoundedQueue>,
    /// `(global index, ring)` stripe this link produces into.
    queues: Vec<(usize, Arc<SpscRing>)>,
    workers: Vec<WorkerHandle>,
    metrics: Arc<ProxyMetrics>,
    running: Arc<AtomicBool>,
    poll: Poll,
    cmd_rx: MpscReceiver<Command>,
}

/// Live-connection state, rebuilt on every (re)connect.
struct LinkConn {
    stream: TcpStream,
    recv: SnapBuffer,
    send: SnapBuffer,
    /// Link-local system frames; always drain before the shared queue.
    sysq: VecDeque<Vec<u8>>,
    /// Application frame that did not fit the send buffer.
    staged: Option<Vec<u8>>,
    authed: bool,
    want_write: bool,
    last_recv: Instant,
    probe_sent_at: Option<Instant>,
    next_queue: usize,
}

/// Why the current connection is being abandoned.
#[derive(Debug, Clone, Copy)]
enum LinkDown {
    ConnectFailed,
    PeerClosed,
    IoError,
    CorruptFrame,
    AuthRejected,
    ProbeUnacked,
}

impl Link {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while self.running.load(Ordering::Acquire) {
            match self.session(&mut events) {
                Ok(()) => break, // shutdown
                Err(down) => {
                    log::warn!("link {}: connection lost ({:?})", self.id, down);
                }
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.metrics.record_reconnect();
            self.sleep_reconnect();
        }
        log::debug!("link {} stopped", self.id);
    }

    /// Fixed-delay sleep, sliced so shutdown stays responsive.
    fn sleep_reconnect(&self) {
        let deadline = Instant::now() + self.cfg.reconnect_delay;
        while self.running.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(SLEEP_SLICE.min(self.cfg.reconnect_delay));
        }
    }

    /// One connect-serve cycle. `Ok` means shutdown was requested,
    /// `Err` names why the connection went away.
    fn session(&mut self, events: &mut Events) -> std::result::Result<(), LinkDown> {
        let mut stream = TcpStream::connect(self.addr).map_err(|e| {
            log::debug!("link {}: connect to {} failed: {}", self.id, self.addr, e);
            LinkDown::ConnectFailed
        })?;
        self.poll
            .registry()
            .register(&mut stream, CONN_TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(|_| LinkDown::IoError)?;

        let mut conn = LinkConn {
            stream,
            recv: SnapBuffer::with_capacity(self.cfg.recv_buffer_size),
            send: SnapBuffer::with_capacity(self.cfg.recv_buffer_size),
            sysq: VecDeque::new(),
            staged: None,
            authed: false,
            want_write: true, // connect completion arrives as writable
            last_recv: Instant::now(),
            probe_sent_at: None,
            next_queue: 0,
        };

        // Auth is the first frame on the wire, queued before the
        // connect even completes.
        let auth = LinkAuthReq {
            node_id: self.cfg.node_id,
            user: self.cfg.auth.user.clone(),
            password: self.cfg.auth.password.clone(),
        };
        conn.sysq.push_back(frame::encode(
            sys::LINK_AUTH_REQ,
            self.cfg.node_id,
            FLAG_SYSTEM,
            &auth.encode(),
        ));

        let result = self.serve(events, &mut conn);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        result
    }

    fn serve(
        &mut self,
        events: &mut Events,
        conn: &mut LinkConn,
    ) -> std::result::Result<(), LinkDown> {
        let mut connected = false;

        loop {
            if !self.running.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Err(e) = self.poll.poll(events, Some(POLL_TIMEOUT)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    // Poll loss is unrecoverable for this thread.
                    log::error!("link {}: poll failed: {}", self.id, e);
                    std::process::abort();
                }
                events.clear();
            }

            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    Command::Shutdown => {
                        self.running.store(false, Ordering::Release);
                    }
                    _ => {} // wake-only commands: flush below covers it
                }
            }

            for event in events.iter() {
                if event.token() != CONN_TOKEN {
                    continue;
                }
                if !connected && event.is_writable() {
                    // Connect completion; a refused connect also lands
                    // here, distinguished by the pending socket error.
                    if let Ok(Some(e)) | Err(e) = conn.stream.take_error() {
                        log::debug!("link {}: connect failed: {}", self.id, e);
                        return Err(LinkDown::ConnectFailed);
                    }
                    connected = true;
                    log::info!("link {}: connected to {}", self.id, self.addr);
                    conn.last_recv = Instant::now();
                }
                if event.is_readable() {
                    self.on_readable(conn)?;
                }
            }

            if connected {
                self.flush(conn)?;
                self.keepalive_tick(conn)?;
                self.sync_write_interest(conn);
            }
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    fn on_readable(&mut self, conn: &mut LinkConn) -> std::result::Result<(), LinkDown> {
        loop {
            conn.recv.compact();
            if conn.recv.free() == 0 {
                self.decode_pending(conn)?;
                conn.recv.compact();
                if conn.recv.free() == 0 {
                    return Err(LinkDown::CorruptFrame);
                }
                continue;
            }

            let n = match conn.stream.read(conn.recv.appendable()) {
                Ok(0) => return Err(LinkDown::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("link {}: read failed: {}", self.id, e);
                    return Err(LinkDown::IoError);
                }
            };
            conn.recv.advance_filled(n);
            conn.last_recv = Instant::now();
            conn.probe_sent_at = None;

            self.decode_pending(conn)?;
        }
        Ok(())
    }

    fn decode_pending(&mut self, conn: &mut LinkConn) -> std::result::Result<(), LinkDown> {
        loop {
            let (header, consumed, body_start) = match frame::try_decode(
                conn.recv.window(),
                self.cfg.max_body_size,
                self.cfg.type_max,
            ) {
                DecodeOutcome::NeedMore => return Ok(()),
                DecodeOutcome::Corrupt => {
                    log::warn!("link {}: corrupt frame from server", self.id);
                    return Err(LinkDown::CorruptFrame);
                }
                DecodeOutcome::Frame {
                    header,
                    body,
                    consumed,
                } => (header, consumed, consumed - body.len()),
            };

            let body = conn.recv.window()[body_start..consumed].to_vec();
            let outcome = if header.is_system() {
                self.handle_system(conn, header, &body)
            } else {
                self.enqueue_application(conn, header, &body);
                Ok(())
            };
            conn.recv.advance_consumed(consumed);
            outcome?;
        }
    }

    fn handle_system(
        &mut self,
        conn: &mut LinkConn,
        header: FrameHeader,
        body: &[u8],
    ) -> std::result::Result<(), LinkDown> {
        match header.msg_type {
            sys::KEEPALIVE_REQ => {
                conn.sysq.push_back(frame::encode(
                    sys::KEEPALIVE_RSP,
                    self.cfg.node_id,
                    FLAG_SYSTEM,
                    &[],
                ));
                Ok(())
            }
            sys::KEEPALIVE_RSP => Ok(()), // probe state cleared by the read
            sys::LINK_AUTH_RSP => {
                let Some(rsp) = LinkAuthRsp::decode(body) else {
                    return Err(LinkDown::CorruptFrame);
                };
                if rsp.succ {
                    conn.authed = true;
                    log::info!(
                        "link {}: authenticated with server node {}",
                        self.id,
                        rsp.node_id
                    );
                    Ok(())
                } else {
                    log::warn!("link {}: authentication rejected", self.id);
                    Err(LinkDown::AuthRejected)
                }
            }
            other => {
                log::debug!("link {}: unexpected system type {}", self.id, other);
                Ok(())
            }
        }
    }

    /// Hand an inbound application frame to the local worker pool,
    /// round-robin across this link's rings.
    fn enqueue_application(&mut self, conn: &mut LinkConn, header: FrameHeader, body: &[u8]) {
        self.metrics.record_recv();
        let pick = conn.next_queue % self.queues.len();
        conn.next_queue = conn.next_queue.wrapping_add(1);
        let (global_idx, ring) = &self.queues[pick];

        let Some(mut block) = ring.alloc_block() else {
            self.metrics.record_recv_drop();
            log::debug!("link {}: recv ring {} full, dropped", self.id, global_idx);
            self.workers[global_idx % self.workers.len()].notify();
            return;
        };
        block.extend_from_slice(body);
        let item = RecvItem {
            header: FrameHeader {
                msg_type: header.msg_type,
                origin: header.origin,
                flag: FLAG_APPLICATION,
                length: header.length,
            },
            body: block,
        };
        if let Err(item) = ring.try_push(item) {
            ring.release(item.body);
            self.metrics.record_recv_drop();
            log::debug!("link {}: recv ring {} full, dropped", self.id, global_idx);
        }
        self.workers[global_idx % self.workers.len()].notify();
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Fill the send buffer (system list first, then the shared queue
    /// once authenticated) and write until the socket would block.
    fn flush(&mut self, conn: &mut LinkConn) -> std::result::Result<(), LinkDown> {
        loop {
            self.refill_send(conn);
            if conn.send.is_empty() {
                return Ok(());
            }
            match conn.stream.write(conn.send.window()) {
                Ok(0) => return Err(LinkDown::IoError),
                Ok(n) => conn.send.advance_consumed(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("link {}: write failed: {}", self.id, e);
                    return Err(LinkDown::IoError);
                }
            }
        }
    }

    fn refill_send(&mut self, conn: &mut LinkConn) {
        loop {
            let frame = if let Some(staged) = conn.staged.take() {
                staged
            } else if let Some(sys_frame) = conn.sysq.pop_front() {
                sys_frame
            } else if conn.authed {
                match self.sendq.try_pop() {
                    Some(item) => {
                        let wire = frame::encode(
                            item.header.msg_type,
                            item.header.origin,
                            FLAG_APPLICATION,
                            &item.body,
                        );
                        self.sendq.release(item.body);
                        wire
                    }
                    None => return,
                }
            } else {
                return;
            };

            if frame.len() > conn.send.free() {
                conn.send.compact();
            }
            if frame.len() > conn.send.free() {
                conn.staged = Some(frame);
                return;
            }
            conn.send.append(&frame);
        }
    }

    fn sync_write_interest(&mut self, conn: &mut LinkConn) {
        let want = !conn.send.is_empty()
            || conn.staged.is_some()
            || !conn.sysq.is_empty()
            || (conn.authed && !self.sendq.is_empty());
        if want == conn.want_write {
            return;
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if self
            .poll
            .registry()
            .reregister(&mut conn.stream, CONN_TOKEN, interest)
            .is_ok()
        {
            conn.want_write = want;
        }
    }

    // ------------------------------------------------------------------
    // Keepalive
    // ------------------------------------------------------------------

    fn keepalive_tick(&mut self, conn: &mut LinkConn) -> std::result::Result<(), LinkDown> {
        if !conn.authed {
            return Ok(());
        }
        if let Some(sent_at) = conn.probe_sent_at {
            if sent_at.elapsed() >= self.cfg.keepalive_interval {
                log::warn!("link {}: keepalive unacknowledged", self.id);
                return Err(LinkDown::ProbeUnacked);
            }
            return Ok(());
        }
        if conn.last_recv.elapsed() >= self.cfg.keepalive_interval {
            conn.sysq.push_back(frame::encode(
                sys::KEEPALIVE_REQ,
                self.cfg.node_id,
                FLAG_SYSTEM,
                &[],
            ));
            conn.probe_sent_at = Some(Instant::now());
        }
        Ok(())
    }
}
