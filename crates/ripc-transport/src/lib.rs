//! Non-blocking TCP transport primitives.
//!
//! Provides the socket types everything else builds on:
//! - [`TcpSocket`] — a connected (or still-connecting) non-blocking stream
//! - [`TcpAcceptor`] — a bound non-blocking listener
//!
//! Both register with a [`mio::Registry`] for readiness events. This is the
//! lowest layer of ripc; it knows nothing about framing or the handshake.

pub mod error;
pub mod tcp;

pub use error::{Result, TransportError};
pub use tcp::{TcpAcceptor, TcpSocket};
