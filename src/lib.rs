//! # verihome-realtime
//!
//! Client-side realtime connections for VeriHome: one WebSocket per named
//! endpoint (`messaging`, `notifications`, ...) with typed envelopes and
//! automatic recovery.
//!
//! ## Features
//!
//! - **Pub/sub** keyed by envelope type, plus the `"*"` wildcard
//! - **Status observers** for every endpoint's connection state
//! - **Auto-reconnection** with exponential backoff and an attempt cap
//! - **Heartbeat** via `{"type":"ping"}` envelopes
//! - **Host events** for online/offline and visibility changes
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use verihome_realtime::{ConnectionManager, Envelope, ManagerConfig};
//!
//! let manager = ConnectionManager::new(ManagerConfig::default());
//!
//! let sub = manager.subscribe("new_notification", |envelope| {
//!     println!("notification: {:?}", envelope.data);
//! });
//!
//! manager.connect("notifications", Some(&token)).await?;
//! manager.send("notifications", &Envelope::new("mark_read", None));
//!
//! sub.unsubscribe();
//! manager.shutdown().await;
//! ```

mod config;
mod dispatch;
mod endpoint;
mod envelope;
mod error;
mod heartbeat;
mod host;
mod link;
mod manager;
mod metrics;
mod status;

pub use config::{
    BackoffConfig, ConfigError, HeartbeatConfig, ManagerConfig, ManagerConfigBuilder,
    DEFAULT_BASE_URL,
};
pub use dispatch::{EnvelopeCallback, StatusCallback, Subscription};
pub use endpoint::EndpointClient;
pub use envelope::{Envelope, EnvelopeKind, Topic, WILDCARD};
pub use error::{Error, ErrorKind};
pub use host::{AlertSink, ConnectivityAlert, HostEvent, LogAlerts, NoAuth, StaticToken, TokenProvider};
pub use manager::ConnectionManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use status::{
    CloseDisposition, ConnectionStatus, LinkPhase, ReconnectDecision, ReconnectPolicy,
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};

// Re-export http types for handshake headers
pub use http::{HeaderName, HeaderValue};

/// Result type for verihome-realtime operations
pub type Result<T> = std::result::Result<T, Error>;
