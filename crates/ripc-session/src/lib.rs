//! RIPC session layer: channel lifecycle and the event loop that drives it.
//!
//! The pieces, leaf to root:
//! - [`options`] — immutable connect/bind configuration
//! - [`buffer`] — output buffer pool with move-only handles
//! - [`channel`] — one connection's handshake state machine and
//!   read/write/flush/ping operations
//! - [`ping`] — per-channel heartbeat timers
//! - [`mux`] — the per-worker readiness-driven multiplexer
//! - [`worker`] — fan-out of accepted channels across worker threads
//! - [`server`] — the listening side
//!
//! A typical non-blocking client: [`Channel::connect`] → register with a
//! [`Multiplexer`] → handle [`ChannelEvent`]s from `drive`. A server:
//! [`Server::bind`] → `accept` → [`WorkerPool::assign`].

pub mod buffer;
pub mod channel;
pub mod error;
pub mod mux;
pub mod options;
pub mod ping;
pub mod server;
pub mod worker;

pub use buffer::{BufferPool, PoolBuffer, SharedBudget};
pub use channel::{
    Channel, ChannelInfo, ChannelRole, ChannelState, FlushStatus, InitStatus, ReadEvent,
    WriteOutcome,
};
pub use error::{Result, SessionError};
pub use mux::{ChannelEvent, MuxConfig, Multiplexer};
pub use options::{BindOptions, ConnectOptions, ConnectionKind};
pub use ping::{Liveness, PingMonitor};
pub use server::Server;
pub use worker::{Role, WorkerConfig, WorkerPool, WorkerStats};
