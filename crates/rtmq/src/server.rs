// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server context: owns the thread pools and the shared state.
//!
//! ```text
//!                    +----------+
//!   TCP connects --> | listener | --AddConnection--> receivers (N)
//!                    +----------+                       |
//!                                        app frames --> queues --> workers (M)
//!                                                                     |
//!                                                               HandlerRegistry
//!   send_to_node / publish --> dist queues --> receivers --> sockets
//! ```
//!
//! Construction is two-phase: [`RtmqServer::new`] validates the config
//! and builds every queue, table, and counter; [`RtmqServer::launch`]
//! binds the listening socket and only then spawns threads, so a bad
//! port fails the call with no cleanup needed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use mio::{Poll, Waker};

use crate::command::{Command, DistItem, ReceiverHandle, WorkerHandle};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::frame::{self, FLAG_APPLICATION};
use crate::listener::{self, ListenerHandle};
use crate::metrics::{AdminSnapshot, ListenerMetrics, ReceiverMetrics, WorkerMetrics};
use crate::queue::{BoundedQueue, MsgQueue};
use crate::receiver::{self, ReceiverCtx, WAKER_TOKEN};
use crate::registry::HandlerRegistry;
use crate::routing::{RoutingTable, SubscribeTable};
use crate::wake::WakeNotifier;
use crate::worker::{self, WorkerCtx};

struct Runtime {
    listener: ListenerHandle,
    receivers: Vec<ReceiverHandle>,
    receiver_joins: Vec<JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
    worker_joins: Vec<JoinHandle<()>>,
}

/// A message-transport server endpoint.
pub struct RtmqServer {
    cfg: Arc<ServerConfig>,
    registry: Arc<HandlerRegistry>,
    routing: Arc<RoutingTable>,
    subs: Arc<SubscribeTable>,
    queues: Vec<Arc<BoundedQueue>>,
    /// One outbound distribution queue per receiver.
    dist: Vec<Arc<ArrayQueue<DistItem>>>,
    listener_metrics: Arc<ListenerMetrics>,
    receiver_metrics: Vec<Arc<ReceiverMetrics>>,
    worker_metrics: Vec<Arc<WorkerMetrics>>,
    running: Arc<AtomicBool>,
    runtime: Option<Runtime>,
}

impl RtmqServer {
    /// Validate `cfg` and build all shared state. No sockets, no
    /// threads; those appear in [`launch`].
    ///
    /// [`launch`]: RtmqServer::launch
    pub fn new(cfg: ServerConfig, registry: HandlerRegistry) -> Result<Self> {
        cfg.validate()?;

        let queues = (0..cfg.recv_queues)
            .map(|_| Arc::new(BoundedQueue::new(cfg.queue.capacity, cfg.queue.unit_size)))
            .collect();
        let dist = (0..cfg.recv_threads)
            .map(|_| Arc::new(ArrayQueue::new(cfg.dist_queue_capacity)))
            .collect();
        let receiver_metrics = (0..cfg.recv_threads)
            .map(|_| Arc::new(ReceiverMetrics::default()))
            .collect();
        let worker_metrics = (0..cfg.work_threads)
            .map(|_| Arc::new(WorkerMetrics::default()))
            .collect();

        Ok(Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(registry),
            routing: Arc::new(RoutingTable::new()),
            subs: Arc::new(SubscribeTable::new()),
            queues,
            dist,
            listener_metrics: Arc::new(ListenerMetrics::default()),
            receiver_metrics,
            worker_metrics,
            running: Arc::new(AtomicBool::new(false)),
            runtime: None,
        })
    }

    /// Bind the listener and spawn every thread.
    ///
    /// The bind happens before any spawn, so an unusable address comes
    /// back as `Err` with nothing to tear down.
    pub fn launch(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::Config("server already launched".into()));
        }
        let bound = listener::bind(&self.cfg)?;
        self.running.store(true, Ordering::Release);

        // Workers first: receivers hold their handles.
        let mut workers = Vec::with_capacity(self.cfg.work_threads);
        let mut worker_joins = Vec::with_capacity(self.cfg.work_threads);
        for id in 0..self.cfg.work_threads {
            let notifier = Arc::new(WakeNotifier::new());
            let (cmd_tx, cmd_rx) = mpsc::channel();
            let ctx = WorkerCtx {
                id,
                queues: self
                    .queues
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

        let mut receivers = Vec::with_capacity(self.cfg.recv_threads);
        let mut receiver_joins = Vec::with_capacity(self.cfg.recv_threads);
        for id in 0..self.cfg.recv_threads {
            let poll = Poll::new().map_err(Error::Io)?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);
            let (cmd_tx, cmd_rx) = mpsc::channel();
            let ctx = ReceiverCtx {
                id,
                queues: self.queues.clone(),
                workers: workers.clone(),
                routing: Arc::clone(&self.routing),
                subs: Arc::clone(&self.subs),
                dist: Arc::clone(&self.dist[id]),
                metrics: Arc::clone(&self.receiver_metrics[id]),
                running: Arc::clone(&self.running),
            };
            receiver_joins
                .push(receiver::spawn(Arc::clone(&self.cfg), ctx, poll, cmd_rx).map_err(Error::Io)?);
            receivers.push(ReceiverHandle::new(cmd_tx, waker));
        }

        let listener = listener::spawn(
            &self.cfg,
            bound,
            receivers.clone(),
            Arc::clone(&self.listener_metrics),
        )?;
        log::info!(
            "{}: listening on {} ({} rsvr, {} work)",
            self.cfg.name,
            listener.local_addr(),
            self.cfg.recv_threads,
            self.cfg.work_threads
        );

        self.runtime = Some(Runtime {
            listener,
            receivers,
            receiver_joins,
            workers,
            worker_joins,
        });
        Ok(())
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|rt| rt.listener.local_addr())
    }

    /// Send one application frame toward `node`.
    ///
    /// Fire-and-forget past this point: delivery rides the owning
    /// receiver's distribution queue and failures after enqueue are
    /// visible only as counters.
    pub fn send_to_node(&self, node: i32, msg_type: u16, payload: &[u8]) -> Result<()> {
        let rt = self.runtime.as_ref().ok_or(Error::NotConnected)?;
        self.check_outbound(msg_type, payload)?;

        let rsvr = self.routing.pick(node).ok_or(Error::NotConnected)?;
        let frame = frame::encode(msg_type, self.cfg.node_id, FLAG_APPLICATION, payload);
        self.dist[rsvr]
            .push(DistItem { node, frame })
            .map_err(|_| Error::QueueFull)?;
        rt.receivers[rsvr].send(Command::DistributePending)
    }

    /// Fan one application frame out to every subscriber of
    /// `msg_type`. Returns how many subscribers it was queued for; a
    /// full distribution queue skips that subscriber (counted at the
    /// receiver as a drop only if the link also vanished — a skip here
    /// is silent by design of the original fire-and-forget surface).
    pub fn publish(&self, msg_type: u16, payload: &[u8]) -> Result<usize> {
        let rt = self.runtime.as_ref().ok_or(Error::NotConnected)?;
        self.check_outbound(msg_type, payload)?;

        let subscribers = self.subs.subscribers(msg_type);
        if subscribers.is_empty() {
            return Ok(0);
        }

        let frame = frame::encode(msg_type, self.cfg.node_id, FLAG_APPLICATION, payload);
        let mut queued = 0;
        let mut touched = vec![false; self.dist.len()];
        for sub in subscribers {
            let item = DistItem {
                node: sub.node,
                frame: frame.clone(),
            };
            if self.dist[sub.rsvr_id].push(item).is_ok() {
                queued += 1;
                touched[sub.rsvr_id] = true;
            }
        }
        for (rsvr, hit) in touched.iter().enumerate() {
            if *hit {
                rt.receivers[rsvr].send(Command::DistributePending)?;
            }
        }
        Ok(queued)
    }

    fn check_outbound(&self, msg_type: u16, payload: &[u8]) -> Result<()> {
        if msg_type >= self.cfg.type_max {
            return Err(Error::InvalidType(msg_type));
        }
        if payload.len() > self.cfg.max_body_size {
            return Err(Error::TooLong(payload.len()));
        }
        Ok(())
    }

    /// The configuration this server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Point-in-time counters across listener, receivers, and workers.
    pub fn admin(&self) -> AdminSnapshot {
        AdminSnapshot {
            accepted: self.listener_metrics.accepted(),
            receivers: self.receiver_metrics.iter().map(|m| m.snapshot()).collect(),
            workers: self.worker_metrics.iter().map(|m| m.snapshot()).collect(),
        }
    }

    /// Nodes with at least one authenticated link right now.
    pub fn connected_nodes(&self) -> Vec<i32> {
        self.routing.nodes()
    }

    /// Stop every thread and join them. Connections run their normal
    /// teardown; queued-but-undispatched messages are discarded.
    pub fn shutdown(&mut self) {
        let Some(mut rt) = self.runtime.take() else {
            return;
        };
        log::info!("{}: shutting down", self.cfg.name);
        self.running.store(false, Ordering::Release);

        rt.listener.shutdown();
        for handle in &rt.receivers {
            let _ = handle.send(Command::Shutdown);
        }
        for handle in &rt.workers {
            let _ = handle.send(Command::Shutdown);
        }
        for join in rt.receiver_joins.drain(..) {
            let _ = join.join();
        }
        for join in rt.worker_joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for RtmqServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> RtmqServer {
        let cfg = ServerConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: 0,
            ..Default::default()
        };
        RtmqServer::new(cfg, HandlerRegistry::new(0xFF)).unwrap()
    }

    #[test]
    fn test_launch_resolves_port() {
        let mut server = test_server();
        assert!(server.local_addr().is_none());
        server.launch().unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        server.shutdown();
    }

    #[test]
    fn test_double_launch_rejected() {
        let mut server = test_server();
        server.launch().unwrap();
        assert!(matches!(server.launch(), Err(Error::Config(_))));
    }

    #[test]
    fn test_send_before_launch() {
        let server = test_server();
        assert!(matches!(
            server.send_to_node(1, 0x10, b"x"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_send_to_unknown_node() {
        let mut server = test_server();
        server.launch().unwrap();
        assert!(matches!(
            server.send_to_node(42, 0x10, b"x"),
            Err(Error::NotConnected)
        ));
        server.shutdown();
    }

    #[test]
    fn test_outbound_validation() {
        let mut server = test_server();
        server.launch().unwrap();
        assert!(matches!(
            server.send_to_node(1, 0xFF, b"x"),
            Err(Error::InvalidType(0xFF))
        ));
        let oversized = vec![0u8; 1 << 20];
        assert!(matches!(
            server.send_to_node(1, 0x10, &oversized),
            Err(Error::TooLong(_))
        ));
        server.shutdown();
    }

    #[test]
    fn test_publish_without_subscribers() {
        let mut server = test_server();
        server.launch().unwrap();
        assert_eq!(server.publish(0x10, b"tick").unwrap(), 0);
        server.shutdown();
    }

    #[test]
    fn test_bad_port_fails_before_spawn() {
        let cfg = ServerConfig {
            listen_addr: "203.0.113.7".into(), // not a local address
            listen_port: 1,
            ..Default::default()
        };
        let mut server = RtmqServer::new(cfg, HandlerRegistry::new(0xFF)).unwrap();
        assert!(server.launch().is_err());
        assert!(server.local_addr().is_none());
    }
}
