//! Listening side of the session layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Registry, Token};
use ripc_transport::TcpAcceptor;
use tracing::debug;

use crate::channel::{Channel, InitStatus};
use crate::error::{Result, SessionError};
use crate::options::BindOptions;

/// A bound listener producing initializing server channels.
///
/// `accept` is non-blocking; integrate the acceptor into a poll via
/// [`register`](Server::register) or call it on a schedule.
#[derive(Debug)]
pub struct Server {
    acceptor: TcpAcceptor,
    options: Arc<BindOptions>,
}

impl Server {
    pub fn bind(options: BindOptions) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(options.address)?;
        Ok(Self {
            acceptor,
            options: Arc::new(options),
        })
    }

    /// Accept one pending connection as an Initializing channel, or `None`
    /// when nothing is pending.
    pub fn accept(&self) -> Result<Option<Channel>> {
        let Some(socket) = self.acceptor.accept()? else {
            return Ok(None);
        };
        debug!(peer = %socket.peer_addr(), "accepted channel, handshake pending");
        Ok(Some(Channel::accepted(socket, Arc::clone(&self.options))))
    }

    /// Blocking accept: wait for a connection and drive its handshake to
    /// Active (or failure) before returning.
    pub fn accept_blocking(&self, timeout: Duration) -> Result<Channel> {
        let deadline = Instant::now() + timeout;
        let mut channel = loop {
            if let Some(channel) = self.accept()? {
                break channel;
            }
            if Instant::now() >= deadline {
                return Err(SessionError::ChannelDown(
                    "blocking accept timed out".to_string(),
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        loop {
            match channel.init()? {
                InitStatus::Active => return Ok(channel),
                InitStatus::InProgress { .. } => {
                    if Instant::now() >= deadline {
                        channel.close();
                        return Err(SessionError::ChannelDown(
                            "blocking accept timed out during handshake".to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// The bound address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn options(&self) -> &BindOptions {
        &self.options
    }

    /// Register the listener for accept readiness on an external poll.
    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<()> {
        self.acceptor.register(registry, token)?;
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.acceptor.deregister(registry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRole, ChannelState, InitStatus};
    use crate::options::ConnectOptions;
    use ripc_frame::{CompressionType, ProtocolType};
    use std::time::{Duration, Instant};

    fn drive_both(client: &mut Channel, server: &mut Channel) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let client_done = matches!(client.state(), ChannelState::Active)
                || matches!(client.init().unwrap(), InitStatus::Active);
            let server_done = matches!(server.state(), ChannelState::Active)
                || matches!(server.init().unwrap(), InitStatus::Active);
            if client_done && server_done {
                return;
            }
            assert!(Instant::now() < deadline, "handshake timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn accept_one(server: &Server) -> Channel {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(channel) = server.accept().unwrap() {
                return channel;
            }
            assert!(Instant::now() < deadline, "accept timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn accept_produces_an_initializing_server_channel() {
        let server = Server::bind(BindOptions::new("127.0.0.1:0".parse().unwrap())).unwrap();
        let mut client = Channel::connect(ConnectOptions::new(server.local_addr())).unwrap();
        let mut accepted = accept_one(&server);

        assert_eq!(accepted.state(), ChannelState::Initializing);
        assert_eq!(accepted.role(), ChannelRole::Server);

        drive_both(&mut client, &mut accepted);
        assert_eq!(client.state(), ChannelState::Active);
        assert_eq!(accepted.state(), ChannelState::Active);
        // Both ends agreed on the same negotiated version and timeout.
        let client_info = client.info().unwrap();
        let server_info = accepted.info().unwrap();
        assert_eq!(client_info.version, server_info.version);
        assert_eq!(client_info.ping_timeout, server_info.ping_timeout);
        assert_eq!(client_info.max_user_msg_size, server_info.max_user_msg_size);
    }

    #[test]
    fn blocking_accept_returns_an_active_channel() {
        let server = Server::bind(BindOptions::new("127.0.0.1:0".parse().unwrap())).unwrap();
        let addr = server.local_addr();
        let client = std::thread::spawn(move || {
            Channel::connect(ConnectOptions::new(addr).with_blocking(true)).unwrap()
        });
        let accepted = server.accept_blocking(Duration::from_secs(5)).unwrap();
        assert_eq!(accepted.state(), ChannelState::Active);
        assert_eq!(client.join().unwrap().state(), ChannelState::Active);
    }

    #[test]
    fn blocking_accept_times_out_with_no_client() {
        let server = Server::bind(BindOptions::new("127.0.0.1:0".parse().unwrap())).unwrap();
        let err = server.accept_blocking(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, SessionError::ChannelDown(_)));
    }

    #[test]
    fn server_clamps_client_ping_timeout() {
        let options = BindOptions::new("127.0.0.1:0".parse().unwrap())
            .with_ping_timeout_range(30, 40);
        let server = Server::bind(options).unwrap();
        let mut client = Channel::connect(
            ConnectOptions::new(server.local_addr()).with_ping_timeout(240),
        )
        .unwrap();
        let mut accepted = accept_one(&server);
        drive_both(&mut client, &mut accepted);

        assert_eq!(client.info().unwrap().ping_timeout, 40, "clamped to server max");
    }

    #[test]
    fn server_refuses_wrong_protocol_type_with_nak() {
        let server = Server::bind(
            BindOptions::new("127.0.0.1:0".parse().unwrap())
                .with_protocol_type(ProtocolType::Rwf),
        )
        .unwrap();
        let mut client = Channel::connect(
            ConnectOptions::new(server.local_addr()).with_protocol_type(ProtocolType::Json),
        )
        .unwrap();
        let mut accepted = accept_one(&server);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut client_err = None;
        let mut server_err = None;
        while client_err.is_none() || server_err.is_none() {
            assert!(Instant::now() < deadline, "refusal timed out");
            if server_err.is_none() {
                if let Err(err) = accepted.init() {
                    server_err = Some(err);
                }
            }
            if client_err.is_none() {
                if let Err(err) = client.init() {
                    client_err = Some(err);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // The server's refusal text reaches the client inside the Nak.
        let client_err = client_err.unwrap();
        assert!(
            matches!(&client_err, crate::SessionError::HandshakeRejected(text)
                if text.contains("unsupported protocol type")),
            "unexpected client error: {client_err}"
        );
        assert_eq!(client.state(), ChannelState::Inactive);
        assert_eq!(accepted.state(), ChannelState::Inactive);
    }

    #[test]
    fn negotiated_compression_follows_server_support() {
        let server = Server::bind(
            BindOptions::new("127.0.0.1:0".parse().unwrap()).with_supported_compression(
                vec![CompressionType::None, CompressionType::Zlib],
                6,
            ),
        )
        .unwrap();
        let mut client = Channel::connect(
            ConnectOptions::new(server.local_addr()).with_compression(CompressionType::Zlib),
        )
        .unwrap();
        let mut accepted = accept_one(&server);
        drive_both(&mut client, &mut accepted);

        let info = client.info().unwrap();
        assert_eq!(info.compression, CompressionType::Zlib);
        assert_eq!(info.compression_level, 6);

        // A type the server does not support degrades to none.
        let mut plain_client = Channel::connect(
            ConnectOptions::new(server.local_addr()).with_compression(CompressionType::Lz4),
        )
        .unwrap();
        let mut plain_accepted = accept_one(&server);
        drive_both(&mut plain_client, &mut plain_accepted);
        assert_eq!(plain_client.info().unwrap().compression, CompressionType::None);
        assert_eq!(plain_client.info().unwrap().compression_level, 0);
    }
}
