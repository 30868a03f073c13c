//! Channel lifecycle: Inactive → Initializing → Active → Inactive.
//!
//! One `Channel` owns one physical connection and its handshake state.
//! `init()` advances the handshake one non-blocking step at a time; once
//! active, `read`/`write`/`flush`/`ping` move data with status-code
//! semantics — transient conditions (would-block, partial writes, buffer
//! pressure) are statuses, not errors, and every error is terminal.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use ripc_frame::{
    decode_client_key, decode_connect_reply, decode_connect_request, encode_client_key,
    encode_connect_ack, encode_connect_nak, encode_connect_request, encode_fragment,
    encode_fragment_header, encode_message, encode_ping, ClientKey, CompressionType, ConnectAck,
    ConnectNak, ConnectReply, ConnectRequest, FrameError, KeyExchange, RipcMessage, RipcVersion,
    HEADER_SIZE, PACKED_HEADER_SIZE,
};
use ripc_transport::TcpSocket;
use tracing::{debug, info, trace};

use crate::buffer::{BufferPool, PoolBuffer, SharedBudget};
use crate::error::{Result, SessionError};
use crate::options::{BindOptions, ConnectOptions};
use crate::ping::{Liveness, PingMonitor};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const MAX_COMBINED_COMPONENT: usize = 253;

/// Channel lifecycle state. `Inactive` is terminal: a closed channel is
/// never reactivated; a fresh connect/accept produces a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Inactive,
    Initializing,
    Active,
}

/// Which side of the handshake this channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

/// Result of one `init()` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Handshake still running. `handle_change` means the underlying socket
    /// was replaced (version fallback re-dial): the owner must deregister
    /// the old handle and register the new one — exactly one live
    /// registration per channel at any time.
    InProgress { handle_change: bool },
    /// Handshake complete; the channel is Active.
    Active,
}

/// One decoded inbound event.
#[derive(Debug)]
pub enum ReadEvent {
    /// A complete message. `pending` is the number of already-buffered bytes
    /// not yet decoded: when it is non-zero (and in general after any
    /// message) the caller must read again without waiting for a fresh
    /// readiness event.
    Message { payload: Bytes, pending: usize },
    /// A heartbeat arrived; liveness was recorded, no payload exists.
    Ping,
    /// Nothing buffered and the socket has no data.
    WouldBlock,
}

/// Result of a `write()`.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Fully handed to the socket.
    Written,
    /// Encoded but not fully sent; the caller must schedule a flush. The
    /// buffer has already been consumed into the queue.
    Pending { queued: usize },
    /// Large-message fragmentation in progress: flush, then call `write`
    /// again with this same buffer until a different outcome is returned.
    CallAgain(PoolBuffer),
}

/// Result of a `flush()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The output queue drained completely.
    Done,
    /// Bytes remain queued; flush again on write readiness.
    Pending,
}

/// Parameters negotiated by the handshake, fixed once Active.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub version: RipcVersion,
    pub major_version: u8,
    pub minor_version: u8,
    pub compression: CompressionType,
    pub compression_level: u8,
    pub ping_timeout: u8,
    pub max_user_msg_size: u16,
    /// Largest payload accepted by a single `write` frame.
    pub max_fragment_size: usize,
    /// Component text the remote end identified itself with.
    pub peer_component_version: Option<String>,
}

enum Config {
    Client(ConnectOptions),
    Server(Arc<BindOptions>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Client: TCP connect still completing.
    Connecting,
    /// Client: ConnectRequest sent, waiting for Ack/Nak.
    WaitAck,
    /// Server: waiting for the ConnectRequest.
    ReadHdr,
    /// Server, version 14: Ack sent, waiting for the ClientKey leg.
    WaitClientKey,
    /// Handshake finished (or never started).
    Done,
}

#[derive(Debug, Clone, Copy)]
struct FragProgress {
    fragment_id: u16,
    total: usize,
    offset: usize,
}

#[derive(Debug)]
struct Reassembly {
    total: usize,
    data: BytesMut,
}

enum Fill {
    Progress,
    WouldBlock,
    Closed,
}

enum FlushProgress {
    Done,
    Pending,
    Closed,
}

/// One physical connection and its protocol state.
pub struct Channel {
    socket: TcpSocket,
    /// Old socket awaiting deregistration after a handle change.
    replaced: Option<TcpSocket>,
    state: ChannelState,
    role: ChannelRole,
    phase: Phase,
    config: Config,
    attempt_version: RipcVersion,
    read_buf: BytesMut,
    pending_out: BytesMut,
    pool: Option<BufferPool>,
    shared: SharedBudget,
    info: Option<ChannelInfo>,
    pending_info: Option<ChannelInfo>,
    monitor: Option<PingMonitor>,
    frag_out: Option<FragProgress>,
    next_fragment_id: u16,
    reassembly: HashMap<u16, Reassembly>,
    shared_key: Option<Bytes>,
}

impl Channel {
    /// Start a client connection.
    ///
    /// Non-blocking by default: the returned channel is Initializing and
    /// must be driven with [`init`](Self::init) (usually by a multiplexer).
    /// With `options.blocking` set, the handshake is driven internally
    /// until Active or failure.
    pub fn connect(options: ConnectOptions) -> Result<Channel> {
        let socket = TcpSocket::connect(options.address)?;
        let blocking = options.blocking;
        let deadline = Instant::now() + options.blocking_timeout;
        let mut channel = Channel::new(
            socket,
            ChannelRole::Client,
            Phase::Connecting,
            Config::Client(options),
        );
        if blocking {
            loop {
                match channel.init()? {
                    InitStatus::Active => break,
                    InitStatus::InProgress { .. } => {
                        if Instant::now() >= deadline {
                            channel.close();
                            return Err(SessionError::ChannelDown(
                                "blocking connect timed out".to_string(),
                            ));
                        }
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            }
        }
        Ok(channel)
    }

    pub(crate) fn accepted(socket: TcpSocket, options: Arc<BindOptions>) -> Channel {
        Channel::new(
            socket,
            ChannelRole::Server,
            Phase::ReadHdr,
            Config::Server(options),
        )
    }

    fn new(socket: TcpSocket, role: ChannelRole, phase: Phase, config: Config) -> Channel {
        Channel {
            socket,
            replaced: None,
            state: ChannelState::Initializing,
            role,
            phase,
            config,
            attempt_version: RipcVersion::CURRENT,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            pending_out: BytesMut::new(),
            pool: None,
            shared: SharedBudget::default(),
            info: None,
            pending_info: None,
            monitor: None,
            frag_out: None,
            next_fragment_id: 1,
            reassembly: HashMap::new(),
            shared_key: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Negotiated parameters; `Some` once Active.
    pub fn info(&self) -> Option<&ChannelInfo> {
        self.info.as_ref()
    }

    /// True iff unsent bytes are queued from a prior write.
    pub fn need_flush(&self) -> bool {
        !self.pending_out.is_empty()
    }

    /// True while the channel wants read readiness.
    pub fn need_read(&self) -> bool {
        self.state != ChannelState::Inactive
    }

    /// Key material exchanged during a version-14 handshake.
    pub fn shared_key(&self) -> Option<&Bytes> {
        self.shared_key.as_ref()
    }

    /// The old socket handle after a mid-handshake handle change; the owner
    /// deregisters it before dropping.
    pub fn take_replaced_socket(&mut self) -> Option<TcpSocket> {
        self.replaced.take()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpSocket {
        &mut self.socket
    }

    /// Whether the handshake currently needs write readiness: the TCP
    /// connect is still completing, or handshake bytes are queued.
    pub(crate) fn handshake_wants_write(&self) -> bool {
        matches!(self.phase, Phase::Connecting) || !self.pending_out.is_empty()
    }

    /// Attach the worker's shared output-buffer budget. Must happen before
    /// the channel goes Active to take effect; the pool is sized at
    /// activation.
    pub(crate) fn attach_shared_budget(&mut self, shared: SharedBudget) {
        self.shared = shared;
    }

    // ---- handshake ----------------------------------------------------

    /// Advance the handshake one non-blocking step.
    ///
    /// Any error is terminal: the channel is closed (Inactive) before the
    /// error is returned, with buffers released.
    pub fn init(&mut self) -> Result<InitStatus> {
        if self.state != ChannelState::Initializing {
            return Err(SessionError::InvalidState("init requires an initializing channel"));
        }
        let result = match self.phase {
            Phase::Connecting => self.init_connecting(),
            Phase::WaitAck => self.init_wait_ack(),
            Phase::ReadHdr => self.init_read_hdr(),
            Phase::WaitClientKey => self.init_wait_client_key(),
            Phase::Done => Err(SessionError::InvalidState("handshake already finished")),
        };
        match result {
            Ok(status) => Ok(status),
            Err(err) => {
                debug!(role = ?self.role, error = %err, "handshake failed");
                self.close();
                Err(err)
            }
        }
    }

    fn init_connecting(&mut self) -> Result<InitStatus> {
        if !self.socket.poll_connected()? {
            return Ok(InitStatus::InProgress {
                handle_change: false,
            });
        }
        let request = self.build_connect_request()?;
        trace!(version = %request.version, "sending connect request");
        encode_connect_request(&request, &mut self.pending_out)?;
        self.phase = Phase::WaitAck;
        match self.flush_some()? {
            FlushProgress::Closed => self.fall_back(),
            _ => Ok(InitStatus::InProgress {
                handle_change: false,
            }),
        }
    }

    fn build_connect_request(&self) -> Result<ConnectRequest> {
        let Config::Client(options) = &self.config else {
            return Err(SessionError::InvalidState("connect request on a server channel"));
        };
        let ip_address = self
            .socket
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(ConnectRequest {
            version: self.attempt_version,
            compression: options.compression,
            ping_timeout: options.ping_timeout,
            protocol_type: options.protocol_type,
            major_version: options.major_version,
            minor_version: options.minor_version,
            hostname,
            ip_address,
            component_version: Some(combined_component(options.component_version.as_deref())),
        })
    }

    fn init_wait_ack(&mut self) -> Result<InitStatus> {
        // Keep pushing any still-queued request bytes first.
        if matches!(self.flush_some()?, FlushProgress::Closed) {
            return self.fall_back();
        }
        loop {
            match decode_connect_reply(&mut self.read_buf)? {
                Some(ConnectReply::Ack(ack)) => return self.on_connect_ack(ack),
                Some(ConnectReply::Nak(nak)) => {
                    return Err(SessionError::HandshakeRejected(nak.text));
                }
                None => match self.fill_read_buf()? {
                    Fill::Progress => continue,
                    Fill::WouldBlock => {
                        return Ok(InitStatus::InProgress {
                            handle_change: false,
                        })
                    }
                    Fill::Closed => return self.fall_back(),
                },
            }
        }
    }

    /// The far end closed the connection before a valid reply: try the next
    /// lower version on a fresh connection, or give up.
    fn fall_back(&mut self) -> Result<InitStatus> {
        let Config::Client(options) = &self.config else {
            return Err(SessionError::ChannelDown(
                "connection closed during handshake".to_string(),
            ));
        };
        let next = self
            .attempt_version
            .fallback()
            .filter(|v| v.supports_protocol_type(options.protocol_type));
        let Some(next) = next else {
            return Err(SessionError::NoSupportedProtocol(format!(
                "far end rejected the handshake and no protocol below version {} is usable",
                self.attempt_version
            )));
        };
        debug!(from = %self.attempt_version, to = %next, "version fallback, re-dialing");
        let fresh = TcpSocket::connect(options.address)?;
        let old = std::mem::replace(&mut self.socket, fresh);
        old.shutdown();
        self.replaced = Some(old);
        self.read_buf.clear();
        self.pending_out.clear();
        self.attempt_version = next;
        self.phase = Phase::Connecting;
        Ok(InitStatus::InProgress {
            handle_change: true,
        })
    }

    fn on_connect_ack(&mut self, ack: ConnectAck) -> Result<InitStatus> {
        if ack.version != self.attempt_version {
            return Err(SessionError::Frame(FrameError::Malformed {
                frame: "ConnectAck",
                reason: "acknowledged version does not match the request",
            }));
        }
        let Config::Client(options) = &self.config else {
            return Err(SessionError::InvalidState("connect ack on a server channel"));
        };
        let guaranteed = options.effective_guaranteed_buffers();
        let info = ChannelInfo {
            version: ack.version,
            major_version: ack.major_version,
            minor_version: ack.minor_version,
            compression: ack.compression,
            compression_level: ack.compression_level,
            ping_timeout: ack.ping_timeout,
            max_user_msg_size: ack.max_user_msg_size,
            max_fragment_size: ack.max_user_msg_size as usize - PACKED_HEADER_SIZE,
            peer_component_version: ack.component_version,
        };
        if let Some(key) = ack.key_exchange {
            let client_key: [u8; 8] = rand::random();
            encode_client_key(
                &ClientKey {
                    key: Bytes::copy_from_slice(&client_key),
                },
                &mut self.pending_out,
            )?;
            if matches!(self.flush_some()?, FlushProgress::Closed) {
                return Err(SessionError::ChannelDown(
                    "connection closed while sending client key".to_string(),
                ));
            }
            self.shared_key = Some(key.key);
        }
        self.activate(info, guaranteed);
        Ok(InitStatus::Active)
    }

    fn init_read_hdr(&mut self) -> Result<InitStatus> {
        let Config::Server(bind) = &self.config else {
            return Err(SessionError::InvalidState("server handshake on a client channel"));
        };
        let bind = Arc::clone(bind);
        loop {
            match decode_connect_request(&mut self.read_buf) {
                Ok(Some(request)) => return self.on_connect_request(request, &bind),
                Ok(None) => match self.fill_read_buf()? {
                    Fill::Progress => continue,
                    Fill::WouldBlock => {
                        return Ok(InitStatus::InProgress {
                            handle_change: false,
                        })
                    }
                    Fill::Closed => {
                        return Err(SessionError::ChannelDown(
                            "connection closed during handshake".to_string(),
                        ))
                    }
                },
                Err(FrameError::UnsupportedConnectionVersion(wire)) => {
                    return self.refuse(format!(
                        "connection refused: unsupported ripc version 0x{wire:04x}"
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send a ConnectNak and fail the handshake; `init` closes the channel.
    fn refuse(&mut self, text: String) -> Result<InitStatus> {
        let nak = ConnectNak { text: text.clone() };
        encode_connect_nak(&nak, &mut self.pending_out)?;
        let _ = self.flush_some();
        Err(SessionError::HandshakeRejected(text))
    }

    fn on_connect_request(
        &mut self,
        request: ConnectRequest,
        bind: &BindOptions,
    ) -> Result<InitStatus> {
        if request.protocol_type != bind.protocol_type {
            return self.refuse(format!(
                "connection refused: unsupported protocol type {}",
                request.protocol_type
            ));
        }
        self.attempt_version = request.version;

        let ping_timeout = bind.clamp_ping_timeout(request.ping_timeout);
        // The lower application-protocol version wins.
        let (major, minor) = if (request.major_version, request.minor_version)
            < (bind.major_version, bind.minor_version)
        {
            (request.major_version, request.minor_version)
        } else {
            (bind.major_version, bind.minor_version)
        };
        let (compression, compression_level) = if request.compression != CompressionType::None
            && bind.supported_compression.contains(&request.compression)
        {
            (request.compression, bind.compression_level)
        } else {
            (CompressionType::None, 0)
        };

        let server_key: Option<[u8; 8]> = request.version.has_key_exchange().then(rand::random);
        let ack = ConnectAck {
            version: request.version,
            max_user_msg_size: bind.max_user_msg_size,
            ping_timeout,
            major_version: major,
            minor_version: minor,
            compression,
            compression_level,
            key_exchange: server_key.map(|key| KeyExchange {
                encryption_type: 1,
                key: Bytes::copy_from_slice(&key),
            }),
            component_version: request
                .version
                .has_component_info()
                .then(|| combined_component(bind.component_version.as_deref())),
        };
        encode_connect_ack(&ack, &mut self.pending_out)?;
        if matches!(self.flush_some()?, FlushProgress::Closed) {
            return Err(SessionError::ChannelDown(
                "connection closed while sending connect ack".to_string(),
            ));
        }

        let info = ChannelInfo {
            version: request.version,
            major_version: major,
            minor_version: minor,
            compression,
            compression_level,
            ping_timeout,
            max_user_msg_size: bind.max_user_msg_size,
            max_fragment_size: bind.max_user_msg_size as usize - PACKED_HEADER_SIZE,
            peer_component_version: request.component_version,
        };
        if request.version.has_key_exchange() {
            self.pending_info = Some(info);
            self.phase = Phase::WaitClientKey;
            Ok(InitStatus::InProgress {
                handle_change: false,
            })
        } else {
            self.activate(info, bind.guaranteed_output_buffers);
            Ok(InitStatus::Active)
        }
    }

    fn init_wait_client_key(&mut self) -> Result<InitStatus> {
        loop {
            match decode_client_key(&mut self.read_buf)? {
                Some(client_key) => {
                    self.shared_key = Some(client_key.key);
                    let info = self
                        .pending_info
                        .take()
                        .ok_or(SessionError::InvalidState("missing negotiated parameters"))?;
                    let Config::Server(bind) = &self.config else {
                        return Err(SessionError::InvalidState("client key on a client channel"));
                    };
                    let guaranteed = bind.guaranteed_output_buffers;
                    self.activate(info, guaranteed);
                    return Ok(InitStatus::Active);
                }
                None => match self.fill_read_buf()? {
                    Fill::Progress => continue,
                    Fill::WouldBlock => {
                        return Ok(InitStatus::InProgress {
                            handle_change: false,
                        })
                    }
                    Fill::Closed => {
                        return Err(SessionError::ChannelDown(
                            "connection closed during key exchange".to_string(),
                        ))
                    }
                },
            }
        }
    }

    fn activate(&mut self, info: ChannelInfo, guaranteed_buffers: usize) {
        let buffer_size = info.max_user_msg_size as usize + HEADER_SIZE;
        self.pool = Some(BufferPool::new(
            guaranteed_buffers,
            buffer_size,
            self.shared.clone(),
        ));
        self.monitor = Some(PingMonitor::new(info.ping_timeout, Instant::now()));
        info!(
            role = ?self.role,
            version = %info.version,
            compression = %info.compression,
            ping_timeout = info.ping_timeout,
            "channel active"
        );
        self.info = Some(info);
        self.phase = Phase::Done;
        self.state = ChannelState::Active;
    }

    // ---- data transfer ------------------------------------------------

    /// Pull one message off the channel.
    ///
    /// After a `Message` the caller must keep reading until `WouldBlock`;
    /// buffered data does not generate fresh readiness events.
    pub fn read(&mut self) -> Result<ReadEvent> {
        if self.state != ChannelState::Active {
            return Err(SessionError::InvalidState("read requires an active channel"));
        }
        let version = match &self.info {
            Some(info) => info.version,
            None => return Err(SessionError::InvalidState("active channel without negotiation")),
        };
        loop {
            match ripc_frame::decode_message(&mut self.read_buf, version) {
                Ok(Some(RipcMessage::Ping)) => {
                    self.mark_received();
                    return Ok(ReadEvent::Ping);
                }
                Ok(Some(RipcMessage::Data(payload))) => {
                    self.mark_received();
                    return Ok(ReadEvent::Message {
                        payload,
                        pending: self.read_buf.len(),
                    });
                }
                Ok(Some(RipcMessage::FragmentHeader {
                    fragment_id,
                    total_len,
                    payload,
                })) => {
                    self.mark_received();
                    let mut data = BytesMut::with_capacity(total_len as usize);
                    data.extend_from_slice(&payload);
                    let entry = Reassembly {
                        total: total_len as usize,
                        data,
                    };
                    if entry.data.len() >= entry.total {
                        return Ok(ReadEvent::Message {
                            payload: entry.data.freeze(),
                            pending: self.read_buf.len(),
                        });
                    }
                    self.reassembly.insert(fragment_id, entry);
                }
                Ok(Some(RipcMessage::Fragment {
                    fragment_id,
                    payload,
                })) => {
                    self.mark_received();
                    let Some(entry) = self.reassembly.get_mut(&fragment_id) else {
                        self.close();
                        return Err(SessionError::Frame(FrameError::Malformed {
                            frame: "RipcMessage",
                            reason: "continuation fragment without a fragment header",
                        }));
                    };
                    entry.data.extend_from_slice(&payload);
                    let complete = entry.data.len() >= entry.total;
                    if complete {
                        if let Some(entry) = self.reassembly.remove(&fragment_id) {
                            return Ok(ReadEvent::Message {
                                payload: entry.data.freeze(),
                                pending: self.read_buf.len(),
                            });
                        }
                    }
                }
                Ok(None) => match self.fill_read_buf() {
                    Ok(Fill::Progress) => continue,
                    Ok(Fill::WouldBlock) => return Ok(ReadEvent::WouldBlock),
                    Ok(Fill::Closed) => {
                        self.close();
                        return Err(SessionError::ChannelDown(
                            "connection closed by peer".to_string(),
                        ));
                    }
                    Err(err) => {
                        self.close();
                        return Err(err);
                    }
                },
                Err(err) => {
                    self.close();
                    return Err(err.into());
                }
            }
        }
    }

    /// Acquire an output buffer, flushing once and retrying before
    /// surfacing starvation.
    pub fn get_buffer(&mut self) -> Result<PoolBuffer> {
        if self.state != ChannelState::Active {
            return Err(SessionError::InvalidState("buffers require an active channel"));
        }
        let pool = self.pool.as_mut().ok_or(SessionError::NoBuffers)?;
        if let Some(buffer) = pool.acquire() {
            return Ok(buffer);
        }
        // One flush-then-retry before giving up.
        let _ = self.flush()?;
        let pool = self.pool.as_mut().ok_or(SessionError::NoBuffers)?;
        pool.acquire().ok_or(SessionError::NoBuffers)
    }

    /// Fill a held buffer with payload bytes.
    pub fn buffer_mut(&mut self, handle: &PoolBuffer) -> Result<&mut BytesMut> {
        let pool = self
            .pool
            .as_mut()
            .ok_or(SessionError::InvalidState("buffers require an active channel"))?;
        Ok(pool.data_mut(handle))
    }

    /// Release a buffer that will not be written.
    pub fn release_buffer(&mut self, handle: PoolBuffer) {
        if let Some(pool) = self.pool.as_mut() {
            pool.release(handle);
        }
    }

    /// Queue one message for the wire, fragmenting as needed.
    ///
    /// The buffer is consumed on `Written`/`Pending`; on `CallAgain` it is
    /// handed back for the next fragment. Every error path releases it.
    pub fn write(&mut self, buffer: PoolBuffer) -> Result<WriteOutcome> {
        if self.state != ChannelState::Active {
            self.release_buffer(buffer);
            return Err(SessionError::InvalidState("write requires an active channel"));
        }
        let (version, max_fragment) = match &self.info {
            Some(info) => (info.version, info.max_fragment_size),
            None => {
                self.release_buffer(buffer);
                return Err(SessionError::InvalidState("active channel without negotiation"));
            }
        };
        let Some(pool) = self.pool.as_ref() else {
            return Err(SessionError::InvalidState("write requires an active channel"));
        };
        let payload_len = pool.data(&buffer).len();

        if self.frag_out.is_none() && payload_len <= max_fragment {
            let encode = match self.pool.as_ref() {
                Some(pool) => encode_message(pool.data(&buffer), &mut self.pending_out),
                None => {
                    return Err(SessionError::InvalidState("write requires an active channel"))
                }
            };
            if let Err(err) = encode {
                self.release_buffer(buffer);
                return Err(err.into());
            }
            self.release_buffer(buffer);
            self.mark_sent();
            return match self.flush_some() {
                Ok(FlushProgress::Done) => Ok(WriteOutcome::Written),
                Ok(FlushProgress::Pending) => Ok(WriteOutcome::Pending {
                    queued: self.pending_out.len(),
                }),
                Ok(FlushProgress::Closed) => {
                    self.close();
                    Err(SessionError::ChannelDown("connection closed by peer".to_string()))
                }
                Err(err) => {
                    self.close();
                    Err(err)
                }
            };
        }

        // Fragmentation: one fragment per call, CallAgain until done.
        let progress = self.frag_out.unwrap_or(FragProgress {
            fragment_id: {
                let id = self.next_fragment_id;
                self.next_fragment_id = self.next_fragment_id.wrapping_add(1).max(1);
                id
            },
            total: payload_len,
            offset: 0,
        });
        let chunk_end = (progress.offset + max_fragment).min(progress.total);
        let encode = match self.pool.as_ref() {
            Some(pool) => {
                let chunk = &pool.data(&buffer)[progress.offset..chunk_end];
                if progress.offset == 0 {
                    encode_fragment_header(
                        version,
                        progress.fragment_id,
                        progress.total as u32,
                        chunk,
                        &mut self.pending_out,
                    )
                } else {
                    encode_fragment(version, progress.fragment_id, chunk, &mut self.pending_out)
                }
            }
            None => {
                return Err(SessionError::InvalidState("write requires an active channel"))
            }
        };
        if let Err(err) = encode {
            self.frag_out = None;
            self.release_buffer(buffer);
            return Err(err.into());
        }

        if chunk_end == progress.total {
            self.frag_out = None;
            self.release_buffer(buffer);
            self.mark_sent();
            match self.flush_some() {
                Ok(FlushProgress::Done) => Ok(WriteOutcome::Written),
                Ok(FlushProgress::Pending) => Ok(WriteOutcome::Pending {
                    queued: self.pending_out.len(),
                }),
                Ok(FlushProgress::Closed) => {
                    self.close();
                    Err(SessionError::ChannelDown("connection closed by peer".to_string()))
                }
                Err(err) => {
                    self.close();
                    Err(err)
                }
            }
        } else {
            self.frag_out = Some(FragProgress {
                offset: chunk_end,
                ..progress
            });
            match self.flush_some() {
                Ok(_) => Ok(WriteOutcome::CallAgain(buffer)),
                Err(err) => {
                    self.frag_out = None;
                    self.release_buffer(buffer);
                    self.close();
                    Err(err)
                }
            }
        }
    }

    /// Push queued output bytes to the socket.
    pub fn flush(&mut self) -> Result<FlushStatus> {
        if self.state != ChannelState::Active {
            return Err(SessionError::InvalidState("flush requires an active channel"));
        }
        match self.flush_some() {
            Ok(FlushProgress::Done) => Ok(FlushStatus::Done),
            Ok(FlushProgress::Pending) => Ok(FlushStatus::Pending),
            Ok(FlushProgress::Closed) => {
                self.close();
                Err(SessionError::ChannelDown("connection closed by peer".to_string()))
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Send a heartbeat frame immediately.
    pub fn ping(&mut self) -> Result<FlushStatus> {
        if self.state != ChannelState::Active {
            return Err(SessionError::InvalidState("ping requires an active channel"));
        }
        encode_ping(&mut self.pending_out);
        self.mark_sent();
        self.flush()
    }

    /// Run the heartbeat timers. Emits a heartbeat when the send timer is
    /// due (unless real traffic already went out) and closes the channel
    /// when the receive timer expires with no inbound message.
    pub fn check_ping(&mut self, now: Instant) -> Result<()> {
        if self.state != ChannelState::Active {
            return Ok(());
        }
        let (emit, liveness, timeout) = match self.monitor.as_mut() {
            Some(monitor) => (
                monitor.check_send(now),
                monitor.check_receive(now),
                monitor.timeout(),
            ),
            None => return Ok(()),
        };
        if emit {
            trace!("emitting heartbeat");
            encode_ping(&mut self.pending_out);
            match self.flush_some() {
                Ok(_) => {}
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }
        }
        if liveness == Liveness::Dead {
            self.close();
            return Err(SessionError::PingTimeout { elapsed: timeout });
        }
        Ok(())
    }

    /// Close the channel: releases queued buffers, shuts the socket down
    /// and makes the state Inactive. Idempotent, and safe to call from the
    /// owner's event-handling path.
    pub fn close(&mut self) {
        if self.state != ChannelState::Inactive {
            debug!(role = ?self.role, "closing channel");
        }
        self.pool = None;
        self.pending_out.clear();
        self.read_buf.clear();
        self.frag_out = None;
        self.reassembly.clear();
        self.monitor = None;
        self.pending_info = None;
        self.socket.shutdown();
        self.state = ChannelState::Inactive;
    }

    // ---- internals ----------------------------------------------------

    fn mark_sent(&mut self) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.mark_sent();
        }
    }

    fn mark_received(&mut self) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.mark_received();
        }
    }

    /// One socket read into the input buffer.
    fn fill_read_buf(&mut self) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(Fill::Progress);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::ConnectionReset
                        || e.kind() == ErrorKind::ConnectionAborted =>
                {
                    return Ok(Fill::Closed)
                }
                Err(e) => return Err(SessionError::Transport(e.into())),
            }
        }
    }

    /// Drain as much of the output queue as the socket accepts.
    fn flush_some(&mut self) -> Result<FlushProgress> {
        while !self.pending_out.is_empty() {
            match self.socket.write(&self.pending_out) {
                Ok(0) => return Ok(FlushProgress::Closed),
                Ok(n) => {
                    self.pending_out.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushProgress::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::BrokenPipe
                        || e.kind() == ErrorKind::ConnectionReset
                        || e.kind() == ErrorKind::ConnectionAborted =>
                {
                    return Ok(FlushProgress::Closed)
                }
                Err(e) => return Err(SessionError::Transport(e.into())),
            }
        }
        Ok(FlushProgress::Done)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("version", &self.info.as_ref().map(|i| i.version))
            .field("need_flush", &self.need_flush())
            .finish()
    }
}

/// Library identification plus optional caller text, `|`-joined and
/// truncated the way the wire expects.
fn combined_component(user: Option<&str>) -> String {
    let base = concat!("ripc ", env!("CARGO_PKG_VERSION"));
    let mut combined = match user {
        Some(user) if !user.is_empty() => format!("{base}|{user}"),
        _ => base.to_string(),
    };
    if combined.len() > MAX_COMBINED_COMPONENT {
        let mut cut = MAX_COMBINED_COMPONENT;
        while !combined.is_char_boundary(cut) {
            cut -= 1;
        }
        combined.truncate(cut);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    fn drive_until_active(channel: &mut Channel) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match channel.init() {
                Ok(InitStatus::Active) => return Ok(()),
                Ok(InitStatus::InProgress { .. }) => {
                    assert!(Instant::now() < deadline, "handshake timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A scripted server that closes `rejects` connections cold before
    /// answering the next one with a canned ConnectAck. Records the
    /// connection-version constant of every request it sees.
    fn scripted_server(
        listener: TcpListener,
        rejects: usize,
    ) -> std::thread::JoinHandle<Vec<u32>> {
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            for attempt in 0.. {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut buf = vec![0u8; 1024];
                let n = stream.read(&mut buf).expect("read request");
                assert!(n >= 7, "short connect request");
                seen.push(u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]));
                if attempt < rejects {
                    drop(stream); // close before any reply: forces fallback
                    continue;
                }
                let mut request = BytesMut::from(&buf[..n]);
                let request = decode_connect_request(&mut request)
                    .expect("decode")
                    .expect("complete");
                let ack = ConnectAck {
                    version: request.version,
                    max_user_msg_size: 6144,
                    ping_timeout: 60,
                    major_version: request.major_version,
                    minor_version: request.minor_version,
                    compression: CompressionType::None,
                    compression_level: 0,
                    key_exchange: request.version.has_key_exchange().then(|| KeyExchange {
                        encryption_type: 1,
                        key: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
                    }),
                    component_version: request
                        .version
                        .has_component_info()
                        .then(|| "scripted".to_string()),
                };
                let mut wire = BytesMut::new();
                encode_connect_ack(&ack, &mut wire).expect("encode ack");
                stream.write_all(&wire).expect("write ack");
                if request.version.has_key_exchange() {
                    // swallow the client key leg
                    let _ = stream.read(&mut buf);
                }
                // keep the stream open briefly so the client can finish
                std::thread::sleep(Duration::from_millis(50));
                return seen;
            }
            unreachable!()
        })
    }

    #[test]
    fn client_handshake_completes_at_current_version() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = scripted_server(listener, 0);

        let mut channel =
            Channel::connect(ConnectOptions::new(addr)).expect("connect should start");
        drive_until_active(&mut channel).expect("handshake should complete");

        let info = channel.info().expect("negotiated info");
        assert_eq!(info.version, RipcVersion::V14);
        assert_eq!(info.max_user_msg_size, 6144);
        assert_eq!(info.max_fragment_size, 6144 - PACKED_HEADER_SIZE);
        assert_eq!(info.peer_component_version.as_deref(), Some("scripted"));
        assert!(channel.shared_key().is_some(), "v14 exchanges key material");

        let seen = server.join().unwrap();
        assert_eq!(seen, vec![RipcVersion::V14.connection_version()]);
    }

    #[test]
    fn fallback_walks_versions_descending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Reject 14 and 13; answer the third attempt.
        let server = scripted_server(listener, 2);

        let mut channel = Channel::connect(ConnectOptions::new(addr)).unwrap();
        drive_until_active(&mut channel).expect("third attempt should succeed");

        let info = channel.info().unwrap();
        assert_eq!(info.version, RipcVersion::V12, "third attempt uses version 12");

        let seen = server.join().unwrap();
        assert_eq!(
            seen,
            vec![
                RipcVersion::V14.connection_version(),
                RipcVersion::V13.connection_version(),
                RipcVersion::V12.connection_version(),
            ]
        );
    }

    #[test]
    fn fallback_reports_handle_change() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = scripted_server(listener, 1);

        let mut channel = Channel::connect(ConnectOptions::new(addr)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_handle_change = false;
        loop {
            match channel.init().expect("handshake should survive fallback") {
                InitStatus::Active => break,
                InitStatus::InProgress { handle_change } => {
                    if handle_change {
                        saw_handle_change = true;
                        assert!(
                            channel.take_replaced_socket().is_some(),
                            "old handle must be surfaced for deregistration"
                        );
                    }
                    assert!(Instant::now() < deadline, "handshake timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
        assert!(saw_handle_change, "fallback must surface the socket swap");
        server.join().unwrap();
    }

    #[test]
    fn non_default_protocol_type_stops_before_version_11() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Reject everything; record what was attempted.
        let server = std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let mut buf = [0u8; 512];
                        if let Ok(n) = stream.read(&mut buf) {
                            if n >= 7 {
                                seen.push(u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]));
                            }
                        }
                        drop(stream);
                        if seen.len() >= 3 {
                            return seen;
                        }
                    }
                    Err(_) => return seen,
                }
            }
        });

        let options = ConnectOptions::new(addr).with_protocol_type(ripc_frame::ProtocolType::Json);
        let mut channel = Channel::connect(options).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match channel.init() {
                Ok(InitStatus::Active) => panic!("handshake cannot succeed"),
                Ok(InitStatus::InProgress { .. }) => {
                    assert!(Instant::now() < deadline, "expected terminal failure");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(err, SessionError::NoSupportedProtocol(_)));
        assert_eq!(channel.state(), ChannelState::Inactive);

        let seen = server.join().unwrap();
        // 14, 13, 12 attempted; version 11 cannot carry a non-default
        // protocol type, so there is no fourth attempt.
        assert_eq!(
            seen,
            vec![
                RipcVersion::V14.connection_version(),
                RipcVersion::V13.connection_version(),
                RipcVersion::V12.connection_version(),
            ]
        );
    }

    #[test]
    fn nak_moves_channel_straight_to_inactive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).unwrap();
            let mut wire = BytesMut::new();
            encode_connect_nak(
                &ConnectNak {
                    text: "connection refused".to_string(),
                },
                &mut wire,
            )
            .unwrap();
            stream.write_all(&wire).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        });

        let mut channel = Channel::connect(ConnectOptions::new(addr)).unwrap();
        let err = drive_until_active(&mut channel).expect_err("nak is terminal");
        assert!(matches!(err, SessionError::HandshakeRejected(text) if text == "connection refused"));
        assert_eq!(channel.state(), ChannelState::Inactive);
        server.join().unwrap();
    }

    #[test]
    fn blocking_connect_returns_an_active_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = scripted_server(listener, 0);

        let channel = Channel::connect(ConnectOptions::new(addr).with_blocking(true))
            .expect("blocking connect should complete the handshake");
        assert_eq!(channel.state(), ChannelState::Active);
        server.join().unwrap();
    }

    #[test]
    fn operations_invalid_before_active() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut channel = Channel::connect(ConnectOptions::new(addr)).unwrap();
        assert!(matches!(channel.read(), Err(SessionError::InvalidState(_))));
        assert!(matches!(channel.flush(), Err(SessionError::InvalidState(_))));
        assert!(matches!(channel.ping(), Err(SessionError::InvalidState(_))));
        assert!(matches!(channel.get_buffer(), Err(SessionError::InvalidState(_))));
        channel.close();
        assert!(matches!(channel.init(), Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn component_string_combines_and_truncates() {
        let plain = combined_component(None);
        assert!(plain.starts_with("ripc "));

        let combined = combined_component(Some("customer app 9.9"));
        assert!(combined.contains('|'));
        assert!(combined.ends_with("customer app 9.9"));

        let oversized = combined_component(Some(&"y".repeat(400)));
        assert_eq!(oversized.len(), MAX_COMBINED_COMPONENT);
    }
}
