//! # Reconnect Backoff & Upstream Connection State
//!
//! Pure state for the upstream driver: the [`ConnectionState`] machine and
//! the [`Backoff`] schedule used between reconnect attempts.
//!
//! ## Backoff
//!
//! The delay before reconnect attempt `n` (0-based) is
//! `min(base * 2^n, max)`. The attempt counter increases on every failed or
//! dropped connection and resets to 0 once a connection opens, so the first
//! drop after a healthy period waits only `base` again.
//!
//! ## Transitions
//!
//! ```text
//! Connecting ──open──► Open ──owner close──► Closing ──► Closed
//!     │                 │
//!     │ connect failed  │ unexpected close
//!     ▼                 ▼
//! ReconnectScheduled ◄──┘ ──delay elapsed──► Connecting
//! ```
//!
//! Once the owner has asked for the connection to close, every path leads to
//! `Closed`; no reconnect is ever scheduled after that.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Lifecycle of one upstream inference connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the provider.
    Connecting,

    /// Handshake completed; frames may be sent.
    Open,

    /// The owner requested a close and the socket is being shut down.
    Closing,

    /// Terminal. The client will not reconnect.
    Closed,

    /// Waiting `delay` before reconnect attempt number `attempt` (1-based).
    ReconnectScheduled { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Handshake succeeded.
    #[must_use]
    pub fn on_open(self) -> Self {
        match self {
            ConnectionState::Connecting => ConnectionState::Open,
            other => other,
        }
    }

    /// The connection dropped or could not be established.
    ///
    /// `closed_by_owner` decides between a scheduled reconnect and the end of
    /// the lifecycle; `backoff` supplies the delay and advances its counter.
    #[must_use]
    pub fn on_close(self, closed_by_owner: bool, backoff: &mut Backoff) -> Self {
        if closed_by_owner || self.is_terminal() {
            return ConnectionState::Closed;
        }
        let delay = backoff.next_delay();
        ConnectionState::ReconnectScheduled {
            attempt: backoff.attempt(),
            delay,
        }
    }

    /// The owner asked for a voluntary close.
    #[must_use]
    pub fn on_owner_close(self) -> Self {
        match self {
            ConnectionState::Open => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// The reconnect delay elapsed.
    #[must_use]
    pub fn on_retry(self) -> Self {
        match self {
            ConnectionState::ReconnectScheduled { .. } => ConnectionState::Connecting,
            other => other,
        }
    }
}

/// Exponential backoff schedule with a cap and a resettable attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Number of reconnect delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next attempt would wait, without advancing the counter.
    pub fn peek_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for the current attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// A connection opened successfully.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
