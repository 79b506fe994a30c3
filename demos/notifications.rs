//! Example: following VeriHome notifications and messages
//!
//! Connects to the `notifications` and `messaging` endpoints, prints what
//! arrives, and shuts down on Ctrl+C.
//!
//! Run with:
//! VERIHOME_WS_URL=ws://localhost:8000/ws VERIHOME_TOKEN=... cargo run --example notifications

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use verihome_realtime::{
    ConnectionManager, EnvelopeKind, HostEvent, ManagerConfig, StaticToken, DEFAULT_BASE_URL,
};

#[derive(Debug, Deserialize)]
struct Notification {
    id: u64,
    title: String,
    #[serde(default)]
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (RUST_LOG=verihome_realtime=debug for link details)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url = std::env::var("VERIHOME_WS_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
    let config = ManagerConfig::builder().base_url(base_url).build()?;

    let mut manager = ConnectionManager::new(config);
    if let Ok(token) = std::env::var("VERIHOME_TOKEN") {
        manager = manager.with_token_provider(StaticToken(token));
    }

    let _status = manager.on_connection_status_change(|endpoint, status| {
        info!(
            "{} -> connected={} connecting={} attempts={}",
            endpoint, status.connected, status.connecting, status.reconnect_attempts
        );
    });

    let _notifications = manager.subscribe(EnvelopeKind::NewNotification, |envelope| {
        match envelope.data_as::<Notification>() {
            Ok(n) => info!("Notification #{}: {} {}", n.id, n.title, n.message),
            Err(e) => warn!("Unreadable notification: {}", e),
        }
    });

    let _everything = manager.subscribe("*", |envelope| {
        info!("Received '{}' at {:?}", envelope.kind, envelope.timestamp);
    });

    // A real host would forward network and visibility changes here
    let (host_events, rx) = mpsc::channel(8);
    manager.attach_host_events(rx);

    for endpoint in ["notifications", "messaging"] {
        if let Err(e) = manager.connect(endpoint, None).await {
            warn!("Could not connect {}: {}", endpoint, e);
        }
    }

    let messaging = manager.endpoint("messaging");
    if messaging.send_kind("get_unread_count", None) {
        info!("Requested unread count");
    }

    // Pretend the page just came back into view; idle endpoints reconnect
    host_events.send(HostEvent::Visible).await?;

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Messages received: {}", snapshot.messages_received_total);
    info!("  Malformed frames: {}", snapshot.malformed_frames_total);

    // Graceful shutdown
    manager.shutdown().await;
    info!("Manager stopped");

    Ok(())
}
