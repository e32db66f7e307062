// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker thread: application message dispatch.
//!
//! Each worker owns a fixed stripe of the shared receive queues
//! (`queue index % workers == worker id`), so two workers never
//! contend on a pop. A worker parks on its [`WakeNotifier`] with a 1s
//! cap and, on every wakeup, drains commands and then scans ALL of its
//! queues. The scan is deliberately redundant: a missed or coalesced
//! notification costs at most one timeout of latency, never a stuck
//! message.
//!
//! Dispatch outcome accounting: a handled message is `proc`, a message
//! with no registered handler is `drop`, a handler returning an error
//! is `err`. The pooled body block is released in every case.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::metrics::WorkerMetrics;
use crate::queue::{MsgQueue, RecvItem};
use crate::registry::HandlerRegistry;
use crate::wake::WakeNotifier;

const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WorkerCtx {
    pub id: usize,
    /// `(global queue index, queue)` pairs this worker owns.
    pub queues: Vec<(usize, Arc<dyn MsgQueue>)>,
    pub registry: Arc<HandlerRegistry>,
    pub notifier: Arc<WakeNotifier>,
    pub metrics: Arc<WorkerMetrics>,
    pub running: Arc<AtomicBool>,
    /// Items taken from one queue per drain pass.
    pub batch: usize,
}

pub fn spawn(
    name: &str,
    ctx: WorkerCtx,
    cmd_rx: MpscReceiver<Command>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let thread_name = format!("{}-work-{}", name, ctx.id);
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(ctx, cmd_rx))
}

fn run(ctx: WorkerCtx, cmd_rx: MpscReceiver<Command>) {
    let mut batch: Vec<RecvItem> = Vec::with_capacity(ctx.batch);

    while ctx.running.load(Ordering::Acquire) {
        ctx.notifier.wait_timeout(WAIT_TIMEOUT);

        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Command::Shutdown => {
                    ctx.running.store(false, Ordering::Release);
                }
                Command::ProcessQueue { .. } => {
                    // Advisory; the scan below covers every queue.
                }
                _ => {}
            }
        }

        // Keep scanning until one full pass finds every queue empty,
        // so a burst larger than one batch drains without re-parking.
        loop {
            let mut drained = 0;
            for (queue_idx, queue) in &ctx.queues {
                let n = queue.multi_pop(ctx.batch, &mut batch);
                if n == 0 {
                    continue;
                }
                drained += n;
                log::trace!("work {}: {} items from queue {}", ctx.id, n, queue_idx);
                for item in batch.drain(..) {
                    dispatch(&ctx, queue.as_ref(), item);
                }
            }
            if drained == 0 {
                break;
            }
        }
    }
    log::debug!("work {} stopped", ctx.id);
}

fn dispatch(ctx: &WorkerCtx, queue: &dyn MsgQueue, item: RecvItem) {
    let RecvItem { header, body } = item;
    match ctx.registry.lookup(header.msg_type) {
        Some(handler) => {
            match handler(header.msg_type, header.origin, &body) {
                Ok(()) => ctx.metrics.record_proc(),
                Err(e) => {
                    ctx.metrics.record_err();
                    log::warn!(
                        "work {}: handler for type {} failed: {}",
                        ctx.id,
                        header.msg_type,
                        e
                    );
                }
            }
        }
        None => {
            ctx.metrics.record_drop();
            log::debug!(
                "work {}: no handler for type {}, dropped",
                ctx.id,
                header.msg_type
            );
        }
    }
    queue.release(body);
}
