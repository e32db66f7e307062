// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server and proxy configuration.
//!
//! Plain structs with working defaults; `validate` runs once before
//! launch and rejects inconsistent sizing (a body that cannot fit a
//! queue block, a read buffer smaller than one frame, an eviction
//! deadline earlier than the warning).

use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::{HEADER_SIZE, PASSWORD_MAX_LEN, USER_MAX_LEN};

/// One accepted credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCred {
    pub user: String,
    pub password: String,
}

impl AuthCred {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.user.is_empty() || self.user.len() > USER_MAX_LEN {
            return Err(Error::Config(format!(
                "user must be 1..={} bytes, got {}",
                USER_MAX_LEN,
                self.user.len()
            )));
        }
        if self.password.len() > PASSWORD_MAX_LEN {
            return Err(Error::Config(format!(
                "password must be at most {} bytes, got {}",
                PASSWORD_MAX_LEN,
                self.password.len()
            )));
        }
        Ok(())
    }
}

/// Sizing of one bounded receive queue and its block pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Slots per queue.
    pub capacity: usize,
    /// Bytes per pooled body block.
    pub unit_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            unit_size: 4096,
        }
    }
}

/// Server-side tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in thread names and log lines.
    pub name: String,
    /// This endpoint's own node id.
    pub node_id: i32,
    pub listen_addr: String,
    pub listen_port: u16,
    pub listen_backlog: i32,
    /// Receiver (I/O) threads.
    pub recv_threads: usize,
    /// Worker (dispatch) threads.
    pub work_threads: usize,
    /// Shared receive queues; defaults to `work_threads * 2`.
    pub recv_queues: usize,
    pub queue: QueueConfig,
    /// Slots in each receiver's outbound distribution queue.
    pub dist_queue_capacity: usize,
    /// Per-connection read buffer.
    pub recv_buffer_size: usize,
    /// Largest accepted frame body.
    pub max_body_size: usize,
    /// Exclusive upper bound on message type ids.
    pub type_max: u16,
    pub nodelay: bool,
    pub socket_recv_buffer: Option<usize>,
    pub socket_send_buffer: Option<usize>,
    /// Quiet period before the server probes a connection.
    pub keepalive_interval: Duration,
    /// Quiet period before an idle warning is logged.
    pub idle_warn: Duration,
    /// Quiet period before the connection is evicted.
    pub idle_evict: Duration,
    /// Items a worker takes from one queue per drain pass.
    pub worker_batch: usize,
    /// Accepted credentials; empty accepts any LinkAuthReq.
    pub auth: Vec<AuthCred>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "rtmq".into(),
            node_id: 0,
            listen_addr: "0.0.0.0".into(),
            listen_port: 0,
            listen_backlog: 128,
            recv_threads: 2,
            work_threads: 2,
            recv_queues: 4,
            queue: QueueConfig::default(),
            dist_queue_capacity: 4096,
            recv_buffer_size: 64 * 1024,
            max_body_size: 4096 - HEADER_SIZE,
            type_max: 0xFF,
            nodelay: true,
            socket_recv_buffer: None,
            socket_send_buffer: None,
            keepalive_interval: Duration::from_secs(30),
            idle_warn: Duration::from_secs(30),
            idle_evict: Duration::from_secs(60),
            worker_batch: 32,
            auth: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }
        if self.recv_threads == 0 || self.work_threads == 0 {
            return Err(Error::Config(
                "recv_threads and work_threads must be nonzero".into(),
            ));
        }
        if self.recv_queues == 0 {
            return Err(Error::Config("recv_queues must be nonzero".into()));
        }
        validate_queue_sizing(
            &self.queue,
            self.max_body_size,
            self.recv_buffer_size,
            self.type_max,
        )?;
        if self.idle_evict < self.idle_warn {
            return Err(Error::Config(format!(
                "idle_evict ({:?}) must not precede idle_warn ({:?})",
                self.idle_evict, self.idle_warn
            )));
        }
        if self.worker_batch == 0 {
            return Err(Error::Config("worker_batch must be nonzero".into()));
        }
        if self.dist_queue_capacity == 0 {
            return Err(Error::Config("dist_queue_capacity must be nonzero".into()));
        }
        for cred in &self.auth {
            cred.validate()?;
        }
        Ok(())
    }
}

/// Client-side tuning.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    /// This client's node id, sent in every frame header.
    pub node_id: i32,
    pub server_addr: String,
    /// Parallel links to the server.
    pub link_threads: usize,
    pub work_threads: usize,
    /// Receive queues per link thread.
    pub recv_queues: usize,
    pub queue: QueueConfig,
    /// Slots in the shared application send queue.
    pub send_queue_capacity: usize,
    pub recv_buffer_size: usize,
    pub max_body_size: usize,
    pub type_max: u16,
    pub nodelay: bool,
    /// Quiet period before the client probes the server.
    pub keepalive_interval: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    pub worker_batch: usize,
    pub auth: AuthCred,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: "rtmq-proxy".into(),
            node_id: 0,
            server_addr: "127.0.0.1:0".into(),
            link_threads: 1,
            work_threads: 1,
            recv_queues: 2,
            queue: QueueConfig::default(),
            send_queue_capacity: 4096,
            recv_buffer_size: 64 * 1024,
            max_body_size: 4096 - HEADER_SIZE,
            type_max: 0xFF,
            nodelay: true,
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            worker_batch: 32,
            auth: AuthCred::new("", ""),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }
        if self.node_id <= 0 {
            return Err(Error::Config(format!(
                "node_id must be positive, got {}",
                self.node_id
            )));
        }
        if self.link_threads == 0 || self.work_threads == 0 {
            return Err(Error::Config(
                "link_threads and work_threads must be nonzero".into(),
            ));
        }
        if self.recv_queues == 0 {
            return Err(Error::Config("recv_queues must be nonzero".into()));
        }
        validate_queue_sizing(
            &self.queue,
            self.max_body_size,
            self.recv_buffer_size,
            self.type_max,
        )?;
        if self.send_queue_capacity == 0 {
            return Err(Error::Config("send_queue_capacity must be nonzero".into()));
        }
        if self.worker_batch == 0 {
            return Err(Error::Config("worker_batch must be nonzero".into()));
        }
        if self.auth.user.len() > USER_MAX_LEN {
            return Err(Error::Config(format!(
                "user must be at most {} bytes",
                USER_MAX_LEN
            )));
        }
        if self.auth.password.len() > PASSWORD_MAX_LEN {
            return Err(Error::Config(format!(
                "password must be at most {} bytes",
                PASSWORD_MAX_LEN
            )));
        }
        Ok(())
    }
}

fn validate_queue_sizing(
    queue: &QueueConfig,
    max_body_size: usize,
    recv_buffer_size: usize,
    type_max: u16,
) -> Result<()> {
    if queue.capacity == 0 || queue.unit_size == 0 {
        return Err(Error::Config(
            "queue capacity and unit_size must be nonzero".into(),
        ));
    }
    if queue.unit_size < max_body_size {
        return Err(Error::Config(format!(
            "queue unit_size ({}) cannot hold max_body_size ({})",
            queue.unit_size, max_body_size
        )));
    }
    if recv_buffer_size < HEADER_SIZE + max_body_size {
        return Err(Error::Config(format!(
            "recv_buffer_size ({}) cannot hold one full frame ({})",
            recv_buffer_size,
            HEADER_SIZE + max_body_size
        )));
    }
    if type_max == 0 {
        return Err(Error::Config("type_max must be nonzero".into()));
    }
    Ok(())
}
