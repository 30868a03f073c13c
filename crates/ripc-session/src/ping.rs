//! Per-channel heartbeat timers.
//!
//! Two independent deadlines: a send timer at one third of the negotiated
//! timeout (a heartbeat goes out unless real traffic already did), and a
//! receive timer at the full timeout (silence past it is fatal).

use std::time::{Duration, Instant};

/// Outcome of the receive-liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Nothing arrived within the full timeout; the connection is dead.
    Dead,
}

#[derive(Debug)]
pub struct PingMonitor {
    timeout: Duration,
    next_send: Instant,
    next_receive: Instant,
    sent_since_check: bool,
    received_since_check: bool,
}

impl PingMonitor {
    pub fn new(timeout_secs: u8, now: Instant) -> Self {
        let timeout = Duration::from_secs(u64::from(timeout_secs.max(1)));
        Self {
            timeout,
            next_send: now + timeout / 3,
            next_receive: now + timeout,
            sent_since_check: false,
            received_since_check: false,
        }
    }

    /// The negotiated timeout driving both deadlines.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Note that a substantive message (or heartbeat) went out.
    pub fn mark_sent(&mut self) {
        self.sent_since_check = true;
    }

    /// Note that anything — including a bare heartbeat — arrived.
    pub fn mark_received(&mut self) {
        self.received_since_check = true;
    }

    /// Whether a heartbeat should be emitted now. Advances the send timer
    /// when due; suppressed when traffic was already sent since the last
    /// check (the heartbeat piggybacks on real messages).
    pub fn check_send(&mut self, now: Instant) -> bool {
        if now < self.next_send {
            return false;
        }
        let emit = !self.sent_since_check;
        self.sent_since_check = false;
        self.next_send = now + self.timeout / 3;
        emit
    }

    /// Receive-side liveness. `Dead` is unconditional once the full timeout
    /// elapses without any inbound message.
    pub fn check_receive(&mut self, now: Instant) -> Liveness {
        if now < self.next_receive {
            return Liveness::Alive;
        }
        if self.received_since_check {
            self.received_since_check = false;
            self.next_receive = now + self.timeout;
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    /// The earliest of the two deadlines, for scheduling the poll timeout.
    pub fn next_deadline(&self) -> Instant {
        self.next_send.min(self.next_receive)
    }
}
