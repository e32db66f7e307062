// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Accept thread.
//!
//! One thread owns the listening socket. Each accepted connection gets
//! a process-unique serial, has `TCP_NODELAY` applied, and is handed
//! to a receiver thread chosen round-robin; from that point the
//! receiver owns the socket exclusively. The listener never reads or
//! writes payload bytes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::command::{Command, ReceiverHandle};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::ListenerMetrics;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Poll timeout; bounds shutdown latency when no waker fires.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bind the listening socket with the configured backlog and buffer
/// sizes. Done before any thread spawns so a bad address fails the
/// launch synchronously.
pub fn bind(cfg: &ServerConfig) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", cfg.listen_addr, cfg.listen_port)
        .parse()
        .map_err(|e| Error::Config(format!("bad listen address: {}", e)))?;

    let domain = Domain::for_address(addr);
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Bind)?;
    socket.set_reuse_address(true).map_err(Error::Bind)?;
    if let Some(size) = cfg.socket_recv_buffer {
        socket.set_recv_buffer_size(size).map_err(Error::Bind)?;
    }
    if let Some(size) = cfg.socket_send_buffer {
        socket.set_send_buffer_size(size).map_err(Error::Bind)?;
    }
    socket.bind(&addr.into()).map_err(Error::Bind)?;
    socket.listen(cfg.listen_backlog).map_err(Error::Bind)?;
    socket.set_nonblocking(true).map_err(Error::Bind)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Running listener thread plus its stop controls.
pub struct ListenerHandle {
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the thread.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the accept thread over an already-bound socket.
pub fn spawn(
    cfg: &ServerConfig,
    mut listener: TcpListener,
    receivers: Vec<ReceiverHandle>,
    metrics: Arc<ListenerMetrics>,
) -> Result<ListenerHandle> {
    let local_addr = listener.local_addr().map_err(Error::Bind)?;
    let poll = Poll::new().map_err(Error::Io)?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)
        .map_err(Error::Io)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(Error::Io)?);

    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);
    let nodelay = cfg.nodelay;
    let name = cfg.name.clone();

    let join = std::thread::Builder::new()
        .name(format!("{}-lsn", name))
        .spawn(move || {
            accept_loop(poll, listener, receivers, metrics, thread_running, nodelay);
        })
        .map_err(Error::Io)?;

    Ok(ListenerHandle {
        waker,
        running,
        join: Some(join),
        local_addr,
    })
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    receivers: Vec<ReceiverHandle>,
    metrics: Arc<ListenerMetrics>,
    running: Arc<AtomicBool>,
    nodelay: bool,
) {
    let mut events = Events::with_capacity(64);
    let mut serial: u64 = 0;
    let mut next_rsvr: usize = 0;

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // Poll loss is unrecoverable; every socket here goes deaf.
            log::error!("listener poll failed: {}", e);
            std::process::abort();
        }

        for event in events.iter() {
            if event.token() != LISTENER {
                continue; // waker; loop condition re-checked above
            }
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        break;
                    }
                };

                serial += 1;
                if nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("nodelay on {} failed: {}", peer, e);
                    }
                }

                let rsvr = next_rsvr % receivers.len();
                next_rsvr = next_rsvr.wrapping_add(1);
                log::debug!("accepted {} serial={} -> rsvr {}", peer, serial, rsvr);

                if receivers[rsvr]
                    .send(Command::AddConnection {
                        stream,
                        serial,
                        peer,
                    })
                    .is_err()
                {
                    // Receiver gone; socket closes on drop.
                    log::error!("rsvr {} unreachable, dropping {}", rsvr, peer);
                    continue;
                }
                metrics.record_accept();
            }
        }
    }
    log::debug!("listener stopped");
}
