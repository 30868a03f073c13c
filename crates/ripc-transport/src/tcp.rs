use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// A non-blocking TCP stream.
///
/// Created by [`TcpSocket::connect`] (in which case the connection may still
/// be in progress — see [`TcpSocket::poll_connected`]) or returned by
/// [`TcpAcceptor::accept`]. Reads and writes never block; they return
/// `ErrorKind::WouldBlock` when the socket is not ready.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    peer: SocketAddr,
    nodelay_applied: bool,
}

impl TcpSocket {
    /// Start a non-blocking connect to `addr`.
    ///
    /// The returned socket is usually still connecting; callers observe
    /// completion via [`poll_connected`](Self::poll_connected) (typically
    /// after a writable readiness event).
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr,
            source: e,
        })?;
        debug!(%addr, "tcp connect started");
        Ok(Self {
            stream,
            peer: addr,
            nodelay_applied: false,
        })
    }

    fn from_accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        // Accepted sockets are connected; apply TCP_NODELAY right away.
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            peer,
            nodelay_applied: true,
        }
    }

    /// Check whether a non-blocking connect has completed.
    ///
    /// Returns `Ok(false)` while the connect is still in progress, `Ok(true)`
    /// once the socket is usable, and an error if the connect failed.
    pub fn poll_connected(&mut self) -> Result<bool> {
        if let Some(err) = self.stream.take_error().map_err(TransportError::Io)? {
            return Err(TransportError::Connect {
                addr: self.peer,
                source: err,
            });
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                if !self.nodelay_applied {
                    let _ = self.stream.set_nodelay(true);
                    self.nodelay_applied = true;
                }
                Ok(true)
            }
            Err(e)
                if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(TransportError::Connect {
                addr: self.peer,
                source: e,
            }),
        }
    }

    /// The remote address this socket is (or will be) connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The local address of this socket, once bound by connect or accept.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr().map_err(TransportError::Io)
    }

    /// Register this socket with a poll registry.
    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.stream
            .register(registry, token, interest)
            .map_err(TransportError::Io)
    }

    /// Change the interest set of an existing registration.
    pub fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.stream
            .reregister(registry, token, interest)
            .map_err(TransportError::Io)
    }

    /// Remove this socket from a poll registry.
    pub fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.stream.deregister(registry).map_err(TransportError::Io)
    }

    /// Shut down both directions of the stream. Errors are ignored; the
    /// socket may already be gone.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

/// A bound non-blocking TCP listener.
pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr,
            source: e,
        })?;
        let local = listener.local_addr().map_err(TransportError::Io)?;
        info!(%local, "listening");
        Ok(Self { listener, local })
    }

    /// Accept one pending connection, or `None` if none is ready.
    pub fn accept(&self) -> Result<Option<TcpSocket>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                Ok(Some(TcpSocket::from_accepted(stream, peer)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Accept(e)),
        }
    }

    /// The locally bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Register the listener for accept readiness.
    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<()> {
        self.listener
            .register(registry, token, Interest::READABLE)
            .map_err(TransportError::Io)
    }

    /// Remove the listener from a poll registry.
    pub fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.listener.deregister(registry).map_err(TransportError::Io)
    }
}

impl std::fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor").field("local", &self.local).finish()
    }
}
