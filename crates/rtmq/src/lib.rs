// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # RTMQ - Real-Time Message Queue transport
//!
//! A thread-based TCP message transport for node-addressed delivery:
//! a binary framing protocol, link authentication and keepalive,
//! bounded in-process queues, and type-based dispatch to registered
//! handlers, with topic-style fan-out via subscriptions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtmq::{HandlerRegistry, RtmqServer, ServerConfig};
//!
//! fn main() -> rtmq::Result<()> {
//!     let mut registry = HandlerRegistry::new(0xFF);
//!     registry.register(0x20, |msg_type, origin, body| {
//!         println!("type {} from node {}: {} bytes", msg_type, origin, body.len());
//!         Ok(())
//!     })?;
//!
//!     let cfg = ServerConfig {
//!         listen_addr: "0.0.0.0".into(),
//!         listen_port: 28810,
//!         ..Default::default()
//!     };
//!     let mut server = RtmqServer::new(cfg, registry)?;
//!     server.launch()?;
//!
//!     // Reply toward a connected node.
//!     server.send_to_node(3001, 0x21, b"ack")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Application                           |
//! |     HandlerRegistry callbacks | send_to_node | publish       |
//! +--------------------------------------------------------------+
//! |                        Worker pool (M)                       |
//! |     striped queue ownership | batch drain | dispatch         |
//! +--------------------------------------------------------------+
//! |                       Receiver pool (N)                      |
//! |  mio poll | frame decode | auth/keepalive | routing tables   |
//! +--------------------------------------------------------------+
//! |                    Listener   |   Proxy links (K)            |
//! |  accept + round-robin handoff | connect/auth/reconnect       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every frame is a fixed 15-byte header plus body (see [`frame`]).
//! System frames (auth, keepalive, subscribe) are consumed inside the
//! I/O threads; application frames cross a bounded queue to a worker.
//! Full queues drop and count, they never block the wire.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RtmqServer`] | Listening endpoint: accepts links, dispatches inbound frames |
//! | [`Proxy`] | Client endpoint: authenticated links to one server |
//! | [`HandlerRegistry`] | Message-type to callback table, fixed at launch |
//! | [`ServerConfig`] / [`ProxyConfig`] | Tuning knobs with working defaults |
//! | [`AdminSnapshot`] | Point-in-time counters across all threads |

pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod queue;
pub mod registry;

mod command;
mod listener;
mod proxy;
mod receiver;
mod routing;
mod server;
mod snap;
mod wake;
mod worker;

pub use config::{AuthCred, ProxyConfig, QueueConfig, ServerConfig};
pub use error::{Error, Result};
pub use metrics::{
    AdminSnapshot, ProxySnapshot, ReceiverSnapshot, WorkerSnapshot,
};
pub use proxy::Proxy;
pub use registry::{Handler, HandlerRegistry};
pub use server::RtmqServer;
