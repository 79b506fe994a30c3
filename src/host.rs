//! Collaborators supplied by the host application.
//!
//! The manager does not authenticate, render alerts, or watch the network
//! itself; the host plugs those in through the traits below.

use std::fmt;
use tracing::{error, warn};

/// Source of the bearer token appended to authenticated endpoint URLs.
pub trait TokenProvider: Send + Sync + 'static {
    /// The token to use right now, if any
    fn current_token(&self) -> Option<String>;

    /// Whether a user session is active
    fn is_authenticated(&self) -> bool {
        self.current_token().is_some()
    }
}

/// Provider for anonymous use; never supplies a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl TokenProvider for NoAuth {
    fn current_token(&self) -> Option<String> {
        None
    }
}

/// Provider with a fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn current_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// User-visible connectivity warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityAlert {
    /// The host reported the network went away
    Offline,
    /// An endpoint used up its reconnect attempts and is now left closed
    ReconnectExhausted { endpoint: String, attempts: u32 },
}

impl fmt::Display for ConnectivityAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityAlert::Offline => {
                f.write_str("You are offline. Realtime updates resume when the connection returns.")
            }
            ConnectivityAlert::ReconnectExhausted { endpoint, attempts } => write!(
                f,
                "Lost connection to {} after {} attempts. Please refresh the page.",
                endpoint, attempts
            ),
        }
    }
}

/// Presentation surface for [`ConnectivityAlert`]s (toasts, banners, ...).
pub trait AlertSink: Send + Sync + 'static {
    fn alert(&self, alert: ConnectivityAlert);
}

/// Alert sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn alert(&self, alert: ConnectivityAlert) {
        match &alert {
            ConnectivityAlert::Offline => warn!("{}", alert),
            ConnectivityAlert::ReconnectExhausted { .. } => error!("{}", alert),
        }
    }
}

/// Network and page-visibility signals from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Online,
    Offline,
    /// Page became visible again
    Visible,
    Hidden,
}
