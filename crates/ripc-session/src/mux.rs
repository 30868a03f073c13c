//! Per-worker I/O multiplexer.
//!
//! One `Multiplexer` drives one readiness poll and two channel collections:
//! `initializing` (handshakes in flight) and `active`. A channel migrates
//! from initializing to active exactly once and never back. All interest
//! bits flow through [`sync_interest`](Multiplexer::sync_interest), which
//! recomputes the full mask from channel state — nothing else touches
//! registrations, so a partial interest state cannot exist.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use crate::buffer::SharedBudget;
use crate::channel::{Channel, ChannelState, FlushStatus, InitStatus, ReadEvent};
use crate::error::{Result, SessionError};

/// Multiplexer construction parameters; one explicit struct per worker, no
/// process-wide state.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Readiness events drained per poll call.
    pub event_capacity: usize,
    /// Shared output-buffer overflow budget for this worker's channels.
    pub shared_output_buffers: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            shared_output_buffers: 64,
        }
    }
}

/// What a drive cycle surfaced to the owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Handshake completed; the channel moved to the active set. The owner
    /// may reject activation (e.g. the negotiated fragment size is too
    /// small) by calling [`Multiplexer::close`] — the channel then goes
    /// Inactive without ever carrying traffic.
    Active { token: Token },
    /// One complete inbound message.
    Message { token: Token, payload: Bytes },
    /// The channel was closed by error, liveness timeout or peer.
    Closed { token: Token, reason: SessionError },
}

struct ChannelEntry {
    channel: Channel,
    registered: bool,
    interest: Option<Interest>,
}

/// Readiness-driven event loop over a set of channels.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    channels: HashMap<Token, ChannelEntry>,
    initializing: Vec<Token>,
    active: Vec<Token>,
    next_token: usize,
    shared: SharedBudget,
}

impl Multiplexer {
    pub fn new(config: MuxConfig) -> Result<Self> {
        let poll = Poll::new().map_err(ripc_transport::TransportError::Io)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            channels: HashMap::new(),
            initializing: Vec::new(),
            active: Vec::new(),
            next_token: 0,
            shared: SharedBudget::new(config.shared_output_buffers),
        })
    }

    /// Take ownership of a channel and start driving it.
    pub fn register(&mut self, mut channel: Channel) -> Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        channel.attach_shared_budget(self.shared.clone());
        match channel.state() {
            ChannelState::Initializing => self.initializing.push(token),
            ChannelState::Active => self.active.push(token),
            ChannelState::Inactive => {
                return Err(SessionError::InvalidState("cannot register an inactive channel"))
            }
        }
        debug!(?token, state = ?channel.state(), "channel registered");
        self.channels.insert(
            token,
            ChannelEntry {
                channel,
                registered: false,
                interest: None,
            },
        );
        Ok(token)
    }

    /// Close a channel on the owner's initiative. Synchronous: interest is
    /// deregistered and buffers released before this returns. No `Closed`
    /// event is emitted for owner-initiated closes.
    pub fn close(&mut self, token: Token) -> bool {
        match self.remove_entry(token) {
            Some(mut entry) => {
                entry.channel.close();
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, token: Token) -> Option<&Channel> {
        self.channels.get(&token).map(|e| &e.channel)
    }

    pub fn channel_mut(&mut self, token: Token) -> Option<&mut Channel> {
        self.channels.get_mut(&token).map(|e| &mut e.channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn active_tokens(&self) -> Vec<Token> {
        self.active.clone()
    }

    /// One drive cycle, bounded by `timeout`:
    /// interest sync → handshake advancement → poll → event dispatch →
    /// heartbeat check. Events are appended to `out`.
    pub fn drive(&mut self, timeout: Duration, out: &mut Vec<ChannelEvent>) -> Result<()> {
        self.sync_interest()?;

        // Handshakes can progress without a readiness event (buffered
        // bytes, fresh registrations, re-dials), so advance them every
        // cycle.
        for token in self.initializing.clone() {
            self.advance_init(token, out);
        }
        self.sync_interest()?;

        self.poll
            .poll(&mut self.events, Some(timeout))
            .map_err(ripc_transport::TransportError::Io)?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            if self.initializing.contains(&token) {
                self.advance_init(token, out);
                continue;
            }
            if !self.active.contains(&token) {
                // Channel vanished mid-cycle (owner close); tolerated.
                continue;
            }
            if writable {
                self.flush_channel(token, out);
            }
            if readable {
                self.read_loop(token, out);
            }
        }

        let now = Instant::now();
        for token in self.active.clone() {
            let result = match self.channels.get_mut(&token) {
                Some(entry) => entry.channel.check_ping(now),
                None => continue,
            };
            if let Err(err) = result {
                self.close_with(token, err, out);
            }
        }
        Ok(())
    }

    /// Recompute every channel's interest mask from its state and
    /// `need_flush`/read appetite. The only place registrations change.
    fn sync_interest(&mut self) -> Result<()> {
        let registry = self.poll.registry();
        for (token, entry) in self.channels.iter_mut() {
            let desired = match entry.channel.state() {
                ChannelState::Inactive => None,
                ChannelState::Initializing => {
                    let mut interest = Interest::READABLE;
                    if entry.channel.handshake_wants_write() {
                        interest |= Interest::WRITABLE;
                    }
                    Some(interest)
                }
                ChannelState::Active => {
                    let mut interest = Interest::READABLE;
                    if entry.channel.need_flush() {
                        interest |= Interest::WRITABLE;
                    }
                    Some(interest)
                }
            };
            match desired {
                None => {
                    if entry.registered {
                        let _ = entry.channel.socket_mut().deregister(registry);
                        entry.registered = false;
                        entry.interest = None;
                    }
                }
                Some(interest) => {
                    if !entry.registered {
                        entry.channel.socket_mut().register(registry, *token, interest)?;
                        entry.registered = true;
                        entry.interest = Some(interest);
                    } else if entry.interest != Some(interest) {
                        entry
                            .channel
                            .socket_mut()
                            .reregister(registry, *token, interest)?;
                        entry.interest = Some(interest);
                    }
                }
            }
        }
        Ok(())
    }

    fn advance_init(&mut self, token: Token, out: &mut Vec<ChannelEvent>) {
        let result = match self.channels.get_mut(&token) {
            Some(entry) => entry.channel.init(),
            None => return,
        };
        match result {
            Ok(InitStatus::Active) => {
                self.initializing.retain(|t| *t != token);
                self.active.push(token);
                trace!(?token, "channel initializing -> active");
                out.push(ChannelEvent::Active { token });
                // Bytes buffered during the handshake will not produce a
                // fresh readiness event; drain them now.
                self.read_loop(token, out);
            }
            Ok(InitStatus::InProgress { handle_change }) => {
                if handle_change {
                    // The socket was replaced mid-handshake: retire the old
                    // registration and let sync_interest register the new
                    // handle. Exactly one live registration per channel.
                    let registry = self.poll.registry();
                    if let Some(entry) = self.channels.get_mut(&token) {
                        if let Some(mut old) = entry.channel.take_replaced_socket() {
                            let _ = old.deregister(registry);
                        }
                        entry.registered = false;
                        entry.interest = None;
                    }
                }
            }
            Err(err) => self.close_with(token, err, out),
        }
    }

    fn flush_channel(&mut self, token: Token, out: &mut Vec<ChannelEvent>) {
        let result = match self.channels.get_mut(&token) {
            Some(entry) => entry.channel.flush(),
            None => return,
        };
        match result {
            Ok(FlushStatus::Done) | Ok(FlushStatus::Pending) => {}
            Err(err) => self.close_with(token, err, out),
        }
    }

    /// Read until would-block: a positive read means more data may already
    /// be buffered, so re-reading is mandatory, not optional.
    fn read_loop(&mut self, token: Token, out: &mut Vec<ChannelEvent>) {
        loop {
            let result = match self.channels.get_mut(&token) {
                Some(entry) if entry.channel.state() == ChannelState::Active => {
                    entry.channel.read()
                }
                _ => return,
            };
            match result {
                Ok(ReadEvent::Message { payload, .. }) => {
                    out.push(ChannelEvent::Message { token, payload });
                }
                Ok(ReadEvent::Ping) => {}
                Ok(ReadEvent::WouldBlock) => return,
                Err(err) => {
                    self.close_with(token, err, out);
                    return;
                }
            }
        }
    }

    fn close_with(&mut self, token: Token, reason: SessionError, out: &mut Vec<ChannelEvent>) {
        if let Some(mut entry) = self.remove_entry(token) {
            entry.channel.close();
            debug!(?token, %reason, "channel closed");
            out.push(ChannelEvent::Closed { token, reason });
        }
    }

    /// Detach a channel entry, retiring its registrations.
    fn remove_entry(&mut self, token: Token) -> Option<ChannelEntry> {
        let mut entry = self.channels.remove(&token)?;
        self.initializing.retain(|t| *t != token);
        self.active.retain(|t| *t != token);
        let registry = self.poll.registry();
        if entry.registered {
            let _ = entry.channel.socket_mut().deregister(registry);
        }
        if let Some(mut old) = entry.channel.take_replaced_socket() {
            let _ = old.deregister(registry);
        }
        Some(entry)
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("initializing", &self.initializing.len())
            .field("active", &self.active.len())
            .finish()
    }
}
