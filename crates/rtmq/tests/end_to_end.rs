// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests over real sockets on the loopback interface.
//!
//! A minimal blocking wire client drives the server directly where the
//! scenario needs protocol-level control (bad credentials, corrupt
//! bytes, subscriptions); the `Proxy` is used where the scenario is
//! about the client engine itself.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rtmq::frame::{self, sys, DecodeOutcome, FrameHeader, LinkAuthReq, LinkAuthRsp, SubscribeReq};
use rtmq::{AuthCred, HandlerRegistry, Proxy, ProxyConfig, QueueConfig, RtmqServer, ServerConfig};

const MAX_BODY: usize = 64 * 1024;
const TYPE_MAX: u16 = 0xFF;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn base_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        ..Default::default()
    }
}

fn launch(cfg: ServerConfig, registry: HandlerRegistry) -> RtmqServer {
    let mut server = RtmqServer::new(cfg, registry).unwrap();
    server.launch().unwrap();
    server
}

// ----------------------------------------------------------------------
// Minimal blocking wire client
// ----------------------------------------------------------------------

struct WireClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl WireClient {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn send_frame(&mut self, msg_type: u16, origin: i32, flag: u8, body: &[u8]) {
        let wire = frame::encode(msg_type, origin, flag, body);
        self.send_raw(&wire);
    }

    /// Read until one frame decodes or `limit` elapses.
    fn read_frame(&mut self, limit: Duration) -> Option<(FrameHeader, Vec<u8>)> {
        let deadline = Instant::now() + limit;
        loop {
            if let DecodeOutcome::Frame {
                header,
                body,
                consumed,
            } = frame::try_decode(&self.buf, MAX_BODY, TYPE_MAX)
            {
                let frame = (header, body.to_vec());
                self.buf.drain(..consumed);
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None, // peer closed
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return None,
            }
        }
    }

    /// Authenticate and return the server's reply.
    fn auth(&mut self, node_id: i32, user: &str, password: &str) -> Option<LinkAuthRsp> {
        let req = LinkAuthReq {
            node_id,
            user: user.into(),
            password: password.into(),
        };
        self.send_frame(
            sys::LINK_AUTH_REQ,
            node_id,
            frame::FLAG_SYSTEM,
            &req.encode(),
        );
        let (header, body) = self.read_frame(Duration::from_secs(5))?;
        assert_eq!(header.msg_type, sys::LINK_AUTH_RSP);
        LinkAuthRsp::decode(&body)
    }

    fn subscribe(&mut self, node_id: i32, msg_type: u16) {
        let req = SubscribeReq { msg_type };
        self.send_frame(
            sys::SUBSCRIBE_REQ,
            node_id,
            frame::FLAG_SYSTEM,
            &req.encode(),
        );
    }

    /// True once the peer has closed the connection.
    fn peer_closed(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; 4096];
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(_) => {} // late frames (e.g. a flushed auth reply)
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return true,
            }
        }
        false
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn test_auth_then_server_keepalive_roundtrip() {
    init_logging();
    let mut cfg = base_config();
    cfg.auth.push(AuthCred::new("sensor", "pw123"));
    cfg.keepalive_interval = Duration::from_millis(200);
    cfg.idle_warn = Duration::from_secs(5);
    cfg.idle_evict = Duration::from_secs(10);
    let mut server = launch(cfg, HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    let rsp = client.auth(3001, "sensor", "pw123").unwrap();
    assert!(rsp.succ);
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes() == vec![3001]
    }));

    // Stay quiet until the server probes, then answer.
    let (header, _) = client.read_frame(Duration::from_secs(5)).unwrap();
    assert_eq!(header.msg_type, sys::KEEPALIVE_REQ);
    assert_eq!(header.flag, frame::FLAG_SYSTEM);
    client.send_frame(sys::KEEPALIVE_RSP, 3001, frame::FLAG_SYSTEM, &[]);

    // The reply keeps the link alive through another probe cycle.
    let (header, _) = client.read_frame(Duration::from_secs(5)).unwrap();
    assert_eq!(header.msg_type, sys::KEEPALIVE_REQ);
    assert_eq!(server.connected_nodes(), vec![3001]);
    server.shutdown();
}

#[test]
fn test_unregistered_type_counts_drops() {
    init_logging();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    let mut registry = HandlerRegistry::new(TYPE_MAX);
    registry
        .register(0x21, move |_, _, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    let mut server = launch(base_config(), registry);

    let mut client = WireClient::connect(server.local_addr().unwrap());
    assert!(client.auth(42, "anyone", "").unwrap().succ);

    for i in 0..1000u32 {
        client.send_frame(0x30, 42, frame::FLAG_APPLICATION, &i.to_be_bytes());
    }

    assert!(wait_until(Duration::from_secs(10), || {
        server.admin().worker_drops() + server.admin().recv_drops() == 1000
    }));
    let admin = server.admin();
    assert_eq!(admin.proc_total(), 0);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    server.shutdown();
}

#[test]
fn test_idle_connection_evicted() {
    init_logging();
    let mut cfg = base_config();
    cfg.keepalive_interval = Duration::from_secs(60); // never probes
    cfg.idle_warn = Duration::from_millis(200);
    cfg.idle_evict = Duration::from_millis(400);
    let mut server = launch(cfg, HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    assert!(client.auth(7, "anyone", "").unwrap().succ);
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes() == vec![7]
    }));

    // Go silent; the routing entry must drop on eviction.
    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes().is_empty()
    }));
    assert!(client.peer_closed(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || {
        server.admin().connections() == 0
    }));
    server.shutdown();
}

#[test]
fn test_write_only_connection_survives_eviction() {
    init_logging();
    let mut cfg = base_config();
    cfg.keepalive_interval = Duration::from_secs(60); // never probes
    cfg.idle_warn = Duration::from_millis(200);
    cfg.idle_evict = Duration::from_millis(400);
    let mut server = launch(cfg, HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    assert!(client.auth(9, "anyone", "").unwrap().succ);
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes() == vec![9]
    }));

    // Drive outbound traffic well past idle_evict while the client
    // reads silently; a peer both ends are still moving bytes to must
    // not be treated as dead.
    let deadline = Instant::now() + Duration::from_millis(1600);
    let mut received = 0usize;
    while Instant::now() < deadline {
        server.send_to_node(9, 0x31, b"stream").unwrap();
        while client.read_frame(Duration::from_millis(20)).is_some() {
            received += 1;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(received > 0);
    assert_eq!(server.connected_nodes(), vec![9]);

    // Once writes stop too, normal eviction takes over.
    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes().is_empty()
    }));
    server.shutdown();
}

#[test]
fn test_send_to_node_reply() {
    init_logging();
    let mut server = launch(base_config(), HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    assert!(client.auth(5, "anyone", "").unwrap().succ);
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes() == vec![5]
    }));

    server.send_to_node(5, 0x22, b"pong").unwrap();

    let (header, body) = client.read_frame(Duration::from_secs(5)).unwrap();
    assert_eq!(header.msg_type, 0x22);
    assert_eq!(header.flag, frame::FLAG_APPLICATION);
    assert_eq!(body, b"pong");
    server.shutdown();
}

#[test]
fn test_subscription_fanout() {
    init_logging();
    let mut server = launch(base_config(), HandlerRegistry::new(TYPE_MAX));
    let addr = server.local_addr().unwrap();

    let mut alpha = WireClient::connect(addr);
    assert!(alpha.auth(11, "anyone", "").unwrap().succ);
    alpha.subscribe(11, 0x33);

    let mut beta = WireClient::connect(addr);
    assert!(beta.auth(12, "anyone", "").unwrap().succ);
    beta.subscribe(12, 0x33);

    // Subscriptions land asynchronously; publish reports how many
    // subscribers it reached.
    assert!(wait_until(Duration::from_secs(5), || {
        server.publish(0x33, b"tick").unwrap() == 2
    }));

    for client in [&mut alpha, &mut beta] {
        let (header, body) = client.read_frame(Duration::from_secs(5)).unwrap();
        assert_eq!(header.msg_type, 0x33);
        assert_eq!(body, b"tick");
    }
    server.shutdown();
}

#[test]
fn test_bad_credentials_rejected() {
    init_logging();
    let mut cfg = base_config();
    cfg.auth.push(AuthCred::new("sensor", "pw123"));
    let mut server = launch(cfg, HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    let rsp = client.auth(9, "sensor", "wrong").unwrap();
    assert!(!rsp.succ);
    // Reply first, then close; never a routing entry.
    assert!(client.peer_closed(Duration::from_secs(5)));
    assert!(server.connected_nodes().is_empty());
    server.shutdown();
}

#[test]
fn test_corrupt_frame_tears_connection_down() {
    init_logging();
    let mut server = launch(base_config(), HandlerRegistry::new(TYPE_MAX));

    let mut client = WireClient::connect(server.local_addr().unwrap());
    assert!(client.auth(21, "anyone", "").unwrap().succ);
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes() == vec![21]
    }));

    // A bad checksum loses stream sync; the only recovery is teardown.
    client.send_raw(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);

    assert!(client.peer_closed(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_nodes().is_empty()
    }));
    assert!(server.admin().receivers.iter().any(|r| r.err_total >= 1));
    server.shutdown();
}

#[test]
fn test_proxy_roundtrip() {
    init_logging();

    let inbound = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&inbound);
    let mut server_registry = HandlerRegistry::new(TYPE_MAX);
    server_registry
        .register(0x40, move |_, origin, body| {
            assert_eq!(origin, 77);
            assert_eq!(body, b"from-proxy");
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    let mut cfg = base_config();
    cfg.auth.push(AuthCred::new("edge", "edge-pw"));
    let mut server = launch(cfg, server_registry);

    let replies = Arc::new(AtomicU32::new(0));
    let reply_counter = Arc::clone(&replies);
    let mut proxy_registry = HandlerRegistry::new(TYPE_MAX);
    proxy_registry
        .register(0x41, move |_, _, body| {
            assert_eq!(body, b"to-proxy");
            reply_counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    let proxy_cfg = ProxyConfig {
        node_id: 77,
        server_addr: server.local_addr().unwrap().to_string(),
        auth: AuthCred::new("edge", "edge-pw"),
        reconnect_delay: Duration::from_millis(200),
        ..Default::default()
    };
    let mut proxy = Proxy::new(proxy_cfg, proxy_registry).unwrap();
    proxy.launch().unwrap();

    // Link comes up and authenticates.
    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes() == vec![77]
    }));

    for _ in 0..3 {
        proxy.send(0x40, b"from-proxy").unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        inbound.load(Ordering::Relaxed) == 3
    }));

    server.send_to_node(77, 0x41, b"to-proxy").unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        replies.load(Ordering::Relaxed) == 1
    }));
    assert!(proxy.metrics().snapshot().recv_total >= 1);

    proxy.shutdown();
    server.shutdown();
}

#[test]
fn test_proxy_recv_ring_overflow_counts_drops() {
    init_logging();
    let mut server = launch(base_config(), HandlerRegistry::new(TYPE_MAX));

    // One slow worker on a two-slot ring: a burst must overflow it.
    let handled = Arc::new(AtomicU32::new(0));
    let handled_counter = Arc::clone(&handled);
    let mut proxy_registry = HandlerRegistry::new(TYPE_MAX);
    proxy_registry
        .register(0x50, move |_, _, _| {
            std::thread::sleep(Duration::from_millis(150));
            handled_counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    let proxy_cfg = ProxyConfig {
        node_id: 88,
        server_addr: server.local_addr().unwrap().to_string(),
        recv_queues: 1,
        queue: QueueConfig {
            capacity: 2,
            ..Default::default()
        },
        reconnect_delay: Duration::from_millis(200),
        ..Default::default()
    };
    let mut proxy = Proxy::new(proxy_cfg, proxy_registry).unwrap();
    proxy.launch().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes() == vec![88]
    }));

    const BURST: u32 = 30;
    for _ in 0..BURST {
        server.send_to_node(88, 0x50, b"burst").unwrap();
    }

    // Every arrival ends up dispatched or counted as a drop.
    assert!(wait_until(Duration::from_secs(20), || {
        let snap = proxy.metrics().snapshot();
        snap.recv_total == u64::from(BURST)
            && u64::from(handled.load(Ordering::Relaxed)) + snap.recv_drops == u64::from(BURST)
    }));
    assert!(proxy.metrics().snapshot().recv_drops > 0);

    proxy.shutdown();
    server.shutdown();
}

#[test]
fn test_proxy_reconnects_after_server_restart() {
    init_logging();
    let mut cfg = base_config();
    let mut server = launch(cfg.clone(), HandlerRegistry::new(TYPE_MAX));
    let addr = server.local_addr().unwrap();

    let proxy_cfg = ProxyConfig {
        node_id: 88,
        server_addr: addr.to_string(),
        auth: AuthCred::new("any", ""),
        reconnect_delay: Duration::from_millis(100),
        keepalive_interval: Duration::from_millis(300),
        ..Default::default()
    };
    let mut proxy = Proxy::new(proxy_cfg, HandlerRegistry::new(TYPE_MAX)).unwrap();
    proxy.launch().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        server.connected_nodes() == vec![88]
    }));

    // Take the server down, bring it back on the same port.
    server.shutdown();
    drop(server);
    cfg.listen_port = addr.port();
    let mut server = launch(cfg, HandlerRegistry::new(TYPE_MAX));

    assert!(wait_until(Duration::from_secs(15), || {
        server.connected_nodes() == vec![88]
    }));
    assert!(proxy.metrics().snapshot().reconnects >= 1);

    proxy.shutdown();
    server.shutdown();
}
