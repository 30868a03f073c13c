//! Worker fan-out.
//!
//! Each worker thread owns a disjoint set of channels behind its own
//! [`Multiplexer`] and processes events with a role chosen at
//! construction. New channels are handed off through a short-held queue
//! lock; the assignment picks the least-loaded worker. Channel internals
//! are never shared across threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use mio::Token;
use tracing::{debug, warn};

use crate::channel::{Channel, WriteOutcome};
use crate::error::{Result, SessionError};
use crate::mux::{ChannelEvent, MuxConfig, Multiplexer};

/// How a worker treats the channels it owns. A closed set: the handler is
/// picked once at construction, not dispatched dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consume inbound messages.
    Reader,
    /// Push a burst of messages to every active channel each tick.
    Writer,
    /// Echo every inbound message back to its sender.
    Reflector,
}

/// Per-worker configuration; one explicit struct per worker, replacing any
/// process-wide tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub role: Role,
    /// Drive-cycle poll bound.
    pub tick: Duration,
    pub mux: MuxConfig,
    /// Writer role: messages per channel per tick.
    pub write_burst: usize,
    /// Writer role: payload size per message.
    pub write_msg_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            role: Role::Reader,
            tick: Duration::from_millis(50),
            mux: MuxConfig::default(),
            write_burst: 1,
            write_msg_size: 64,
        }
    }
}

/// Counters aggregated across a pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Messages dropped because the buffer pool stayed starved after the
    /// flush-and-retry.
    pub buffer_starvation: u64,
    pub channels_activated: u64,
    pub channels_closed: u64,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    buffer_starvation: AtomicU64,
    channels_activated: AtomicU64,
    channels_closed: AtomicU64,
}

struct WorkerShared {
    /// Hand-off queue: the only cross-worker state besides buffer budgets.
    /// The lock protects queue mutation only, never channel internals.
    queue: Mutex<VecDeque<Channel>>,
    load: AtomicUsize,
    shutdown: AtomicBool,
    counters: Counters,
}

/// A fixed set of worker threads, each driving its own multiplexer.
pub struct WorkerPool {
    workers: Vec<Arc<WorkerShared>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers with identical configuration.
    pub fn start(count: usize, config: WorkerConfig) -> Result<Self> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let shared = Arc::new(WorkerShared {
                queue: Mutex::new(VecDeque::new()),
                load: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            });
            let mux = Multiplexer::new(config.mux.clone())?;
            let worker_shared = Arc::clone(&shared);
            let worker_config = config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ripc-worker-{index}"))
                .spawn(move || worker_loop(worker_shared, mux, worker_config))
                .map_err(|e| SessionError::Transport(e.into()))?;
            workers.push(shared);
            handles.push(handle);
        }
        Ok(Self { workers, handles })
    }

    /// Hand a channel to the least-loaded worker.
    pub fn assign(&self, channel: Channel) {
        let worker = self
            .workers
            .iter()
            .min_by_key(|w| w.load.load(Ordering::Relaxed))
            .expect("pool has at least one worker");
        worker.load.fetch_add(1, Ordering::Relaxed);
        worker
            .queue
            .lock()
            .expect("hand-off queue poisoned")
            .push_back(channel);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Channels currently owned across all workers.
    pub fn total_load(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::Relaxed))
            .sum()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        for worker in &self.workers {
            stats.messages_received += worker.counters.messages_received.load(Ordering::Relaxed);
            stats.messages_sent += worker.counters.messages_sent.load(Ordering::Relaxed);
            stats.buffer_starvation += worker.counters.buffer_starvation.load(Ordering::Relaxed);
            stats.channels_activated +=
                worker.counters.channels_activated.load(Ordering::Relaxed);
            stats.channels_closed += worker.counters.channels_closed.load(Ordering::Relaxed);
        }
        stats
    }

    /// Stop all workers and join their threads; owned channels close.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.shutdown.store(true, Ordering::Relaxed);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>, mut mux: Multiplexer, config: WorkerConfig) {
    let mut events: Vec<ChannelEvent> = Vec::new();
    while !shared.shutdown.load(Ordering::Relaxed) {
        // Drain the hand-off queue; one pop per lock acquisition keeps the
        // hold time minimal.
        loop {
            let channel = shared
                .queue
                .lock()
                .expect("hand-off queue poisoned")
                .pop_front();
            let Some(channel) = channel else { break };
            if let Err(err) = mux.register(channel) {
                warn!(error = %err, "failed to register handed-off channel");
                shared.load.fetch_sub(1, Ordering::Relaxed);
            }
        }

        events.clear();
        if let Err(err) = mux.drive(config.tick, &mut events) {
            warn!(error = %err, "multiplexer drive failed; worker exiting");
            break;
        }

        for event in events.drain(..) {
            match event {
                ChannelEvent::Active { token } => {
                    shared
                        .counters
                        .channels_activated
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(?token, "worker channel active");
                }
                ChannelEvent::Message { token, payload } => {
                    shared
                        .counters
                        .messages_received
                        .fetch_add(1, Ordering::Relaxed);
                    if config.role == Role::Reflector {
                        reflect(&mut mux, token, &payload, &shared);
                    }
                }
                ChannelEvent::Closed { token, reason } => {
                    shared.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
                    shared.load.fetch_sub(1, Ordering::Relaxed);
                    debug!(?token, %reason, "worker channel closed");
                }
            }
        }

        if config.role == Role::Writer {
            write_burst(&mut mux, &config, &shared);
        }
    }
}

/// Echo one payload back on the channel it arrived on. Starvation after
/// the flush-and-retry drops the message and counts the event.
fn reflect(mux: &mut Multiplexer, token: Token, payload: &Bytes, shared: &WorkerShared) {
    match send_on(mux, token, payload) {
        Ok(true) => {
            shared.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {
            shared
                .counters
                .buffer_starvation
                .fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            // The channel closed itself; reap it from the worker's books.
            if mux.close(token) {
                shared.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
                shared.load.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

fn write_burst(mux: &mut Multiplexer, config: &WorkerConfig, shared: &WorkerShared) {
    let payload = Bytes::from(vec![0x2a; config.write_msg_size]);
    for token in mux.active_tokens() {
        for _ in 0..config.write_burst {
            match send_on(mux, token, &payload) {
                Ok(true) => {
                    shared.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    shared
                        .counters
                        .buffer_starvation
                        .fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(_) => {
                    if mux.close(token) {
                        shared.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
                        shared.load.fetch_sub(1, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }
    }
}

/// Send one payload on a channel. `Ok(false)` is buffer starvation.
fn send_on(mux: &mut Multiplexer, token: Token, payload: &[u8]) -> Result<bool> {
    let Some(channel) = mux.channel_mut(token) else {
        return Ok(false);
    };
    let mut buffer = match channel.get_buffer() {
        Ok(buffer) => buffer,
        Err(SessionError::NoBuffers) => return Ok(false),
        Err(err) => return Err(err),
    };
    channel.buffer_mut(&buffer)?.extend_from_slice(payload);
    loop {
        match channel.write(buffer)? {
            WriteOutcome::Written | WriteOutcome::Pending { .. } => return Ok(true),
            WriteOutcome::CallAgain(again) => {
                channel.flush()?;
                buffer = again;
            }
        }
    }
}
