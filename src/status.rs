use crate::config::BackoffConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for an endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code reported when the transport vanished without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Last known state of one endpoint, as seen by observers.
///
/// Only the manager creates these; the constructors keep `connected` and
/// `connecting` from ever being true at the same time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl ConnectionStatus {
    pub(crate) fn connecting(previous: &ConnectionStatus, attempts: u32) -> Self {
        Self {
            connected: false,
            connecting: true,
            last_connected: previous.last_connected,
            reconnect_attempts: attempts,
        }
    }

    pub(crate) fn connected_now() -> Self {
        Self {
            connected: true,
            connecting: false,
            last_connected: Some(Utc::now()),
            reconnect_attempts: 0,
        }
    }

    pub(crate) fn reconnecting(previous: &ConnectionStatus, attempt: u32) -> Self {
        Self {
            connected: false,
            connecting: false,
            last_connected: previous.last_connected,
            reconnect_attempts: attempt,
        }
    }

    /// Terminal state after reconnects ran out; keeps the final attempt count
    pub(crate) fn exhausted(previous: &ConnectionStatus, attempts: u32) -> Self {
        Self {
            connected: false,
            connecting: false,
            last_connected: previous.last_connected,
            reconnect_attempts: attempts,
        }
    }

    pub(crate) fn disconnected(previous: &ConnectionStatus) -> Self {
        Self {
            connected: false,
            connecting: false,
            last_connected: previous.last_connected,
            reconnect_attempts: 0,
        }
    }
}

/// Lifecycle phase of an endpoint's link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    /// First open in flight
    Connecting,
    Connected,
    /// Waiting out backoff, or reopening after an unexpected close
    Reconnecting { attempt: u32 },
    /// Caller asked for the link to close; no reconnect may follow
    Disconnecting,
}

impl LinkPhase {
    /// Whether a reconnect sweep should leave this endpoint alone
    pub fn is_active(&self) -> bool {
        matches!(self, LinkPhase::Connecting | LinkPhase::Connected)
    }
}

/// How a close should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// 1000/1001: the peer meant it, stay closed
    Expected,
    /// Anything else: schedule a reconnect
    Unexpected,
}

impl CloseDisposition {
    /// Classify a close code. `None` means no code was received.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY) => CloseDisposition::Expected,
            _ => CloseDisposition::Unexpected,
        }
    }
}

/// Outcome of asking the policy what to do after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Sleep `delay`, then make reconnect attempt number `attempt` (1-based)
    Retry { delay: Duration, attempt: u32 },
    /// Attempts are used up; stay disconnected until a manual connect
    Exhausted,
}

/// Exponential backoff capped by an attempt count.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    backoff: BackoffConfig,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(backoff: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    /// Decide the next step given the attempts already made since the last
    /// successful open.
    pub fn next(&self, attempts: u32) -> ReconnectDecision {
        if attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        ReconnectDecision::Retry {
            delay: self.backoff.delay_for_attempt(attempts),
            attempt: attempts + 1,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
