// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver thread: the per-connection I/O engine.
//!
//! Each receiver owns a `mio::Poll` and a set of connections handed to
//! it by the listener. No other thread ever touches those sockets. One
//! loop iteration is:
//!
//! 1. `poll` with a 1s cap
//! 2. drain the command channel (new connections, outbound work)
//! 3. readable events: read, decode, consume system frames in place,
//!    push application frames onto the shared queues
//! 4. writable events: flush queued replies and distributed frames
//! 5. time wheel: keepalive probes, idle warnings, idle eviction,
//!    re-notify workers for queues that still hold items
//!
//! System frames never cross a queue: keepalive and auth are answered
//! from inside the loop so a congested worker pool cannot stall link
//! health. Application frames from unauthenticated connections are
//! counted as drops and discarded.
//!
//! A corrupt frame is connection-fatal. The codec has no resync, so
//! the only safe reaction is teardown.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::command::{Command, DistItem, WorkerHandle};
use crate::config::{AuthCred, ServerConfig};
use crate::frame::{
    self, sys, DecodeOutcome, FrameHeader, LinkAuthReq, LinkAuthRsp, SubscribeReq,
    FLAG_APPLICATION,
};
use crate::metrics::ReceiverMetrics;
use crate::queue::{BoundedQueue, MsgQueue, RecvItem};
use crate::routing::{RoutingTable, SubscribeTable};
use crate::snap::SnapBuffer;

/// Waker registration; connection tokens start at [`FIRST_CONN`].
pub const WAKER_TOKEN: Token = Token(0);

const FIRST_CONN: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Threading context shared by the pool, cloned per receiver.
pub struct ReceiverCtx {
    pub id: usize,
    pub queues: Vec<Arc<BoundedQueue>>,
    pub workers: Vec<WorkerHandle>,
    pub routing: Arc<RoutingTable>,
    pub subs: Arc<SubscribeTable>,
    /// Outbound frames routed to this receiver's connections.
    pub dist: Arc<ArrayQueue<DistItem>>,
    pub metrics: Arc<ReceiverMetrics>,
    pub running: Arc<AtomicBool>,
}

enum Keepalive {
    Idle,
    RequestSent,
}

struct Conn {
    stream: TcpStream,
    serial: u64,
    peer: SocketAddr,
    token: Token,
    /// Set on successful link auth.
    node_id: Option<i32>,
    recv: SnapBuffer,
    send: SnapBuffer,
    /// Encoded frames waiting to enter the send buffer.
    outbound: VecDeque<Vec<u8>>,
    want_write: bool,
    last_recv: Instant,
    last_send: Instant,
    idle_logged: bool,
    /// Flush pending bytes, then tear down (failed auth reply path).
    close_after_flush: bool,
    keepalive: Keepalive,
}

impl Conn {
    fn authed(&self) -> bool {
        self.node_id.is_some()
    }

    fn has_pending_output(&self) -> bool {
        !self.send.is_empty() || !self.outbound.is_empty()
    }
}

/// Why a connection is being torn down; logged once per close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    IoError,
    CorruptFrame,
    AuthRejected,
    IdleEvicted,
    KeepaliveTimeout,
    Shutdown,
}

pub fn spawn(
    cfg: Arc<ServerConfig>,
    ctx: ReceiverCtx,
    poll: Poll,
    cmd_rx: MpscReceiver<Command>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let name = format!("{}-rsvr-{}", cfg.name, ctx.id);
    std::thread::Builder::new().name(name).spawn(move || {
        let mut rsvr = Receiver {
            cfg,
            ctx,
            poll,
            cmd_rx,
            conns: HashMap::new(),
            node_conns: HashMap::new(),
            next_token: FIRST_CONN,
            last_tick: Instant::now(),
        };
        rsvr.run();
    })
}

struct Receiver {
    cfg: Arc<ServerConfig>,
    ctx: ReceiverCtx,
    poll: Poll,
    cmd_rx: MpscReceiver<Command>,
    conns: HashMap<Token, Conn>,
    /// node id -> tokens of its authenticated connections here.
    node_conns: HashMap<i32, Vec<Token>>,
    next_token: usize,
    last_tick: Instant,
}

impl Receiver {
    fn run(&mut self) {
        let mut events = Events::with_capacity(256);

        while self.ctx.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // Poll loss is unrecoverable; every socket here goes deaf.
                log::error!("rsvr {}: poll failed: {}", self.ctx.id, e);
                std::process::abort();
            }

            self.drain_commands();

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue; // commands already drained
                }
                if event.is_readable() {
                    if let Some(reason) = self.on_readable(token) {
                        self.teardown(token, reason);
                        continue;
                    }
                }
                if event.is_writable() {
                    if let Some(reason) = self.on_writable(token) {
                        self.teardown(token, reason);
                        continue;
                    }
                }
                self.sync_write_interest(token);
            }

            if self.last_tick.elapsed() >= TICK_INTERVAL {
                self.last_tick = Instant::now();
                self.tick();
            }
        }

        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.teardown(token, CloseReason::Shutdown);
        }
        log::debug!("rsvr {} stopped", self.ctx.id);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::AddConnection {
                    stream,
                    serial,
                    peer,
                } => self.add_connection(stream, serial, peer),
                Command::DistributePending => self.distribute_pending(),
                Command::ProcessQueue { .. } => {
                    // Worker-side command; not ours.
                }
                Command::Shutdown => {
                    self.ctx.running.store(false, Ordering::Release);
                }
            }
        }
        // Distribution queue may have been filled without a command
        // racing ahead of the waker.
        self.distribute_pending();
    }

    fn add_connection(&mut self, mut stream: TcpStream, serial: u64, peer: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            log::error!("rsvr {}: register {} failed: {}", self.ctx.id, peer, e);
            return;
        }

        self.conns.insert(
            token,
            Conn {
                stream,
                serial,
                peer,
                token,
                node_id: None,
                recv: SnapBuffer::with_capacity(self.cfg.recv_buffer_size),
                send: SnapBuffer::with_capacity(self.cfg.recv_buffer_size),
                outbound: VecDeque::new(),
                want_write: false,
                last_recv: Instant::now(),
                last_send: Instant::now(),
                idle_logged: false,
                close_after_flush: false,
                keepalive: Keepalive::Idle,
            },
        );
        self.ctx.metrics.record_conn_open();
        log::debug!("rsvr {}: conn {} serial={} online", self.ctx.id, peer, serial);
    }

    /// Move frames from the distribution queue onto their target
    /// connections' outbound lists.
    fn distribute_pending(&mut self) {
        while let Some(item) = self.ctx.dist.pop() {
            let token = match self.node_conns.get(&item.node) {
                Some(tokens) if !tokens.is_empty() => {
                    tokens[fastrand::usize(..tokens.len())]
                }
                _ => {
                    // Link vanished between routing lookup and here.
                    log::debug!(
                        "rsvr {}: node {} gone, dropping outbound frame",
                        self.ctx.id,
                        item.node
                    );
                    self.ctx.metrics.record_drop();
                    continue;
                }
            };
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.outbound.push_back(item.frame);
            }
            if let Some(reason) = self.on_writable(token) {
                self.teardown(token, reason);
            } else {
                self.sync_write_interest(token);
            }
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Read and decode until the socket would block. Returns a close
    /// reason when the connection must go away.
    fn on_readable(&mut self, token: Token) -> Option<CloseReason> {
        let Self {
            cfg,
            ctx,
            conns,
            node_conns,
            ..
        } = self;
        let conn = conns.get_mut(&token)?;

        loop {
            conn.recv.compact();
            if conn.recv.free() == 0 {
                // Buffer sizing guarantees a full window holds at least
                // one complete frame, so this either consumes or rejects.
                if let Some(reason) = decode_pending(cfg, ctx, node_conns, conn) {
                    return Some(reason);
                }
                conn.recv.compact();
                if conn.recv.free() == 0 {
                    return Some(CloseReason::CorruptFrame);
                }
                continue;
            }

            let n = match conn.stream.read(conn.recv.appendable()) {
                Ok(0) => return Some(CloseReason::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("rsvr {}: read {} failed: {}", ctx.id, conn.peer, e);
                    return Some(CloseReason::IoError);
                }
            };
            conn.recv.advance_filled(n);
            conn.last_recv = Instant::now();
            conn.idle_logged = false;
            conn.keepalive = Keepalive::Idle;

            if let Some(reason) = decode_pending(cfg, ctx, node_conns, conn) {
                return Some(reason);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Flush the send buffer and refill it from the outbound list.
    fn on_writable(&mut self, token: Token) -> Option<CloseReason> {
        let conn = self.conns.get_mut(&token)?;

        loop {
            // Refill the send buffer with whole frames that fit.
            while let Some(front) = conn.outbound.front() {
                if front.len() > conn.send.capacity() {
                    // Cannot ever fit; encoded by us, so this is a bug
                    // guard rather than a peer condition.
                    log::error!(
                        "rsvr {}: outbound frame of {} bytes exceeds buffer",
                        self.ctx.id,
                        front.len()
                    );
                    conn.outbound.pop_front();
                    continue;
                }
                if front.len() > conn.send.free() {
                    conn.send.compact();
                }
                if front.len() > conn.send.free() {
                    break;
                }
                if let Some(frame) = conn.outbound.pop_front() {
                    conn.send.append(&frame);
                }
            }

            if conn.send.is_empty() {
                break;
            }

            match conn.stream.write(conn.send.window()) {
                Ok(0) => return Some(CloseReason::IoError),
                Ok(n) => {
                    conn.send.advance_consumed(n);
                    conn.last_send = Instant::now();
                    conn.idle_logged = false;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("rsvr {}: write {} failed: {}", self.ctx.id, conn.peer, e);
                    return Some(CloseReason::IoError);
                }
            }
        }

        if conn.close_after_flush && !conn.has_pending_output() {
            return Some(CloseReason::AuthRejected);
        }
        None
    }

    /// Register or clear WRITABLE interest to match pending output.
    fn sync_write_interest(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let want = conn.has_pending_output();
        if want == conn.want_write {
            return;
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, interest)
        {
            log::error!("rsvr {}: reregister failed: {}", self.ctx.id, e);
            return;
        }
        conn.want_write = want;
    }

    // ------------------------------------------------------------------
    // Time wheel
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        // Workers can miss a notify when their queue was full at push
        // time; re-notify for any queue still holding items.
        for (idx, queue) in self.ctx.queues.iter().enumerate() {
            let pending = queue.len();
            if pending > 0 {
                let _ = self.ctx.workers[idx % self.ctx.workers.len()].send(
                    Command::ProcessQueue {
                        rsvr_id: self.ctx.id,
                        queue_idx: idx,
                        count: pending,
                    },
                );
            }
        }

        let now = Instant::now();
        let mut probes: Vec<Token> = Vec::new();
        let mut evict: Vec<(Token, CloseReason)> = Vec::new();

        for (token, conn) in &mut self.conns {
            let recv_idle = now.duration_since(conn.last_recv);
            // A connection counts as idle only when both directions are
            // quiet; one we are actively writing to stays alive.
            let idle = recv_idle.min(now.duration_since(conn.last_send));

            if idle >= self.cfg.idle_evict {
                let reason = if matches!(conn.keepalive, Keepalive::RequestSent) {
                    CloseReason::KeepaliveTimeout
                } else {
                    CloseReason::IdleEvicted
                };
                evict.push((*token, reason));
                continue;
            }
            if idle >= self.cfg.idle_warn && !conn.idle_logged {
                log::warn!(
                    "rsvr {}: conn {} serial={} idle for {:?}",
                    self.ctx.id,
                    conn.peer,
                    conn.serial,
                    idle
                );
                conn.idle_logged = true;
            }
            if conn.authed()
                && recv_idle >= self.cfg.keepalive_interval
                && matches!(conn.keepalive, Keepalive::Idle)
            {
                conn.keepalive = Keepalive::RequestSent;
                probes.push(*token);
            }
        }

        let probe = frame::encode(sys::KEEPALIVE_REQ, self.cfg.node_id, frame::FLAG_SYSTEM, &[]);
        for token in probes {
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.outbound.push_back(probe.clone());
            }
            if let Some(reason) = self.on_writable(token) {
                self.teardown(token, reason);
            } else {
                self.sync_write_interest(token);
            }
        }

        for (token, reason) in evict {
            self.teardown(token, reason);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(&mut self, token: Token, reason: CloseReason) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);

        if let Some(node) = conn.node_id {
            self.ctx.routing.remove(node, self.ctx.id);
            if let Some(tokens) = self.node_conns.get_mut(&node) {
                tokens.retain(|t| *t != token);
                if tokens.is_empty() {
                    self.node_conns.remove(&node);
                    // Last link from this node here: its subs go too.
                    self.ctx.subs.unsubscribe_node(node, self.ctx.id);
                }
            }
        }

        self.ctx.metrics.record_conn_close();
        if matches!(reason, CloseReason::IoError | CloseReason::CorruptFrame) {
            self.ctx.metrics.record_err();
        }
        log::info!(
            "rsvr {}: conn {} serial={} closed ({:?})",
            self.ctx.id,
            conn.peer,
            conn.serial,
            reason
        );
    }
}

// ----------------------------------------------------------------------
// Frame handling (free functions to keep borrows field-granular)
// ----------------------------------------------------------------------

/// Decode every complete frame currently in the window.
fn decode_pending(
    cfg: &ServerConfig,
    ctx: &ReceiverCtx,
    node_conns: &mut HashMap<i32, Vec<Token>>,
    conn: &mut Conn,
) -> Option<CloseReason> {
    loop {
        let (header, consumed, body_range) =
            match frame::try_decode(conn.recv.window(), cfg.max_body_size, cfg.type_max) {
                DecodeOutcome::NeedMore => return None,
                DecodeOutcome::Corrupt => {
                    log::warn!(
                        "rsvr {}: corrupt frame from {} serial={}",
                        ctx.id,
                        conn.peer,
                        conn.serial
                    );
                    return Some(CloseReason::CorruptFrame);
                }
                DecodeOutcome::Frame {
                    header,
                    body,
                    consumed,
                } => {
                    let start = consumed - body.len();
                    (header, consumed, start..consumed)
                }
            };

        ctx.metrics.record_recv();
        let reason = if header.is_system() {
            let sys_body = conn.recv.window()[body_range].to_vec();
            handle_system(cfg, ctx, node_conns, conn, header, &sys_body)
        } else {
            let window = conn.recv.window();
            enqueue_application(ctx, conn, header, &window[body_range]);
            None
        };
        conn.recv.advance_consumed(consumed);
        if reason.is_some() {
            return reason;
        }
    }
}

/// Consume one system frame in place.
fn handle_system(
    cfg: &ServerConfig,
    ctx: &ReceiverCtx,
    node_conns: &mut HashMap<i32, Vec<Token>>,
    conn: &mut Conn,
    header: FrameHeader,
    body: &[u8],
) -> Option<CloseReason> {
    match header.msg_type {
        sys::KEEPALIVE_REQ => {
            conn.outbound.push_back(frame::encode(
                sys::KEEPALIVE_RSP,
                cfg.node_id,
                frame::FLAG_SYSTEM,
                &[],
            ));
            None
        }
        sys::KEEPALIVE_RSP => {
            // Liveness already refreshed by the read itself.
            None
        }
        sys::LINK_AUTH_REQ => {
            let Some(req) = LinkAuthReq::decode(body) else {
                log::warn!("rsvr {}: malformed auth request from {}", ctx.id, conn.peer);
                return Some(CloseReason::CorruptFrame);
            };
            let ok = check_credentials(&cfg.auth, &req);
            let rsp = LinkAuthRsp {
                node_id: cfg.node_id,
                succ: ok,
            };
            conn.outbound.push_back(frame::encode(
                sys::LINK_AUTH_RSP,
                cfg.node_id,
                frame::FLAG_SYSTEM,
                &rsp.encode(),
            ));
            if ok {
                if conn.node_id.is_none() {
                    conn.node_id = Some(req.node_id);
                    ctx.routing.add(req.node_id, ctx.id);
                    node_conns.entry(req.node_id).or_default().push(conn.token);
                }
                log::info!(
                    "rsvr {}: node {} authenticated from {} serial={}",
                    ctx.id,
                    req.node_id,
                    conn.peer,
                    conn.serial
                );
                None
            } else {
                log::warn!(
                    "rsvr {}: auth rejected for node {} user {:?} from {}",
                    ctx.id,
                    req.node_id,
                    req.user,
                    conn.peer
                );
                // Reply flushes first, then the connection closes.
                conn.close_after_flush = true;
                None
            }
        }
        sys::SUBSCRIBE_REQ => {
            let Some(node) = conn.node_id else {
                log::debug!("rsvr {}: subscribe before auth from {}", ctx.id, conn.peer);
                ctx.metrics.record_drop();
                return None;
            };
            let Some(req) = SubscribeReq::decode(body) else {
                return Some(CloseReason::CorruptFrame);
            };
            ctx.subs.subscribe(req.msg_type, node, ctx.id);
            log::debug!("rsvr {}: node {} subscribed type {}", ctx.id, node, req.msg_type);
            None
        }
        other => {
            log::debug!("rsvr {}: unknown system type {} from {}", ctx.id, other, conn.peer);
            None
        }
    }
}

fn check_credentials(accepted: &[AuthCred], req: &LinkAuthReq) -> bool {
    if accepted.is_empty() {
        return true;
    }
    accepted
        .iter()
        .any(|c| c.user == req.user && c.password == req.password)
}

/// Copy an application frame into a pooled block and queue it for a
/// worker. Backpressure shows up as drops, never as blocking.
fn enqueue_application(ctx: &ReceiverCtx, conn: &Conn, header: FrameHeader, body: &[u8]) {
    if !conn.authed() {
        log::debug!(
            "rsvr {}: app frame type {} before auth from {}, dropped",
            ctx.id,
            header.msg_type,
            conn.peer
        );
        ctx.metrics.record_drop();
        return;
    }

    let queue_idx = fastrand::usize(..ctx.queues.len());
    let queue = &ctx.queues[queue_idx];

    let worker = &ctx.workers[queue_idx % ctx.workers.len()];
    let Some(mut block) = queue.alloc_block() else {
        ctx.metrics.record_drop();
        // Pool exhausted means the queue is backed up; poke the worker.
        worker.notify();
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
    if let Err(item) = queue.try_push(item) {
        queue.release(item.body);
        ctx.metrics.record_drop();
    }
    let _ = worker.send(Command::ProcessQueue {
        rsvr_id: ctx.id,
        queue_idx,
        count: 1,
    });
}
