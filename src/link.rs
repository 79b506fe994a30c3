use crate::config::ManagerConfig;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::Error;
use crate::heartbeat::Heartbeat;
use crate::host::ConnectivityAlert;
use crate::manager::Shared;
use crate::status::{
    CloseDisposition, ConnectionStatus, LinkPhase, ReconnectDecision, ReconnectPolicy,
    CLOSE_ABNORMAL,
};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands that can be sent to a link
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Write a serialized envelope
    Send(String),
    /// Close with 1000 and stop for good
    Close,
}

/// Result of a link's first open, shared with every caller awaiting `connect`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpenOutcome {
    Pending,
    Opened,
    Failed(OpenFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpenFailure {
    Timeout(Duration),
    Transport(String),
    Cancelled,
}

impl OpenFailure {
    pub(crate) fn into_error(self, endpoint: &str) -> Error {
        match self {
            OpenFailure::Timeout(timeout) => Error::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            OpenFailure::Transport(reason) => Error::connection_failed(endpoint, reason),
            OpenFailure::Cancelled => {
                Error::connection_failed(endpoint, "connection attempt was cancelled")
            }
        }
    }
}

/// Why a session (one open socket) ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Peer sent a close frame, with its code if it had one
    Closed(Option<u16>),
    /// Transport error or EOF without a close frame
    Lost,
    /// Too many missed pongs
    Unhealthy,
    /// Caller asked us to close
    Requested,
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One endpoint's connection task: opens the socket, pumps frames, and
/// reconnects with backoff after unexpected closes.
pub(crate) struct Link {
    endpoint: String,
    generation: u64,
    shared: Arc<Shared>,
    /// Token handed to `connect`; used when the provider has none
    explicit_token: Option<String>,
    command_rx: mpsc::Receiver<LinkCommand>,
    /// Present until the first open settles
    opened_tx: Option<watch::Sender<OpenOutcome>>,
    policy: ReconnectPolicy,
}

impl Link {
    pub(crate) fn new(
        endpoint: String,
        generation: u64,
        shared: Arc<Shared>,
        explicit_token: Option<String>,
        command_rx: mpsc::Receiver<LinkCommand>,
        opened_tx: watch::Sender<OpenOutcome>,
    ) -> Self {
        let policy = ReconnectPolicy::new(
            shared.config.backoff.clone(),
            shared.config.max_reconnect_attempts,
        );
        Self {
            endpoint,
            generation,
            shared,
            explicit_token,
            command_rx,
            opened_tx: Some(opened_tx),
            policy,
        }
    }

    /// Run the link until it is closed, superseded, or out of attempts
    pub(crate) async fn run(mut self) {
        let mut attempts = 0u32;

        loop {
            let is_reconnect = self.opened_tx.is_none();
            let token = if is_reconnect {
                self.shared.resolve_reconnect_token(self.explicit_token.as_deref())
            } else {
                self.shared.resolve_token(self.explicit_token.as_deref())
            };

            let opened = match self.shared.endpoint_url(&self.endpoint, token.as_deref()) {
                Ok(url) => {
                    debug!(
                        "[WS-{}] Connecting to {} (attempt {})",
                        self.endpoint,
                        redact_token(&url),
                        attempts
                    );
                    tokio::select! {
                        result = open_socket(&self.shared.config, &url) => Some(result),
                        _ = wait_for_close(&mut self.command_rx) => None,
                    }
                }
                Err(e) => Some(Err(OpenFailure::Transport(e.to_string()))),
            };

            let end = match opened {
                None => {
                    info!("[WS-{}] Connect cancelled", self.endpoint);
                    self.retire();
                    self.settle_open(OpenOutcome::Failed(OpenFailure::Cancelled));
                    return;
                }
                Some(Err(failure)) => {
                    self.shared.metrics.record_connect_failure();
                    if !is_reconnect {
                        warn!("[WS-{}] Connect failed: {:?}", self.endpoint, failure);
                        self.retire();
                        self.settle_open(OpenOutcome::Failed(failure));
                        return;
                    }
                    debug!(
                        "[WS-{}] Reconnect attempt {} failed: {:?}",
                        self.endpoint, attempts, failure
                    );
                    SessionEnd::Lost
                }
                Some(Ok(ws)) => {
                    let accepted = self.shared.transition(
                        &self.endpoint,
                        self.generation,
                        LinkPhase::Connected,
                        |_| ConnectionStatus::connected_now(),
                    );
                    if !accepted {
                        debug!("[WS-{}] Link no longer wanted, closing fresh socket", self.endpoint);
                        close_quietly(ws).await;
                        self.retire();
                        self.settle_open(OpenOutcome::Failed(OpenFailure::Cancelled));
                        return;
                    }

                    self.shared.metrics.record_connection();
                    attempts = 0;
                    self.settle_open(OpenOutcome::Opened);
                    info!(
                        "[WS-{}] Connected{}",
                        self.endpoint,
                        if is_reconnect { " (reconnected)" } else { "" }
                    );

                    self.session(ws).await
                }
            };

            match end {
                SessionEnd::Requested => {
                    info!("[WS-{}] Closed on request", self.endpoint);
                    self.retire();
                    return;
                }
                SessionEnd::Closed(code)
                    if CloseDisposition::from_code(code) == CloseDisposition::Expected =>
                {
                    info!("[WS-{}] Closed by server (code {:?})", self.endpoint, code);
                    self.retire();
                    return;
                }
                SessionEnd::Closed(code) => {
                    warn!("[WS-{}] Unexpected close (code {:?})", self.endpoint, code);
                }
                SessionEnd::Lost => {
                    debug!("[WS-{}] Connection lost (code {})", self.endpoint, CLOSE_ABNORMAL);
                }
                SessionEnd::Unhealthy => {
                    warn!("[WS-{}] Heartbeat failed, dropping connection", self.endpoint);
                }
            }

            match self.policy.next(attempts) {
                ReconnectDecision::Exhausted => {
                    error!(
                        "[WS-{}] Max reconnection attempts ({}) reached",
                        self.endpoint,
                        self.policy.max_attempts()
                    );
                    self.shared.metrics.record_reconnects_exhausted();
                    let retired = self.shared.retire_with(&self.endpoint, self.generation, |prev| {
                        ConnectionStatus::exhausted(prev, attempts)
                    });
                    if retired {
                        self.shared.alert(ConnectivityAlert::ReconnectExhausted {
                            endpoint: self.endpoint.clone(),
                            attempts,
                        });
                    }
                    return;
                }
                ReconnectDecision::Retry { delay, attempt } => {
                    let scheduled = self.shared.transition(
                        &self.endpoint,
                        self.generation,
                        LinkPhase::Reconnecting { attempt },
                        |prev| ConnectionStatus::reconnecting(prev, attempt),
                    );
                    if !scheduled {
                        self.retire();
                        return;
                    }
                    self.shared.metrics.record_reconnection();
                    info!(
                        "[WS-{}] Reconnecting in {:?} (attempt {}/{})",
                        self.endpoint,
                        delay,
                        attempt,
                        self.policy.max_attempts()
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_close(&mut self.command_rx) => {
                            debug!("[WS-{}] Pending reconnect cancelled", self.endpoint);
                            self.retire();
                            return;
                        }
                    }

                    attempts = attempt;
                    let reopening = self.shared.transition(
                        &self.endpoint,
                        self.generation,
                        LinkPhase::Reconnecting { attempt },
                        |prev| ConnectionStatus::connecting(prev, attempt),
                    );
                    if !reopening {
                        self.retire();
                        return;
                    }
                }
            }
        }
    }

    /// Pump one open socket until it closes
    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = Heartbeat::new(self.shared.config.heartbeat.clone());

        loop {
            let next_heartbeat = heartbeat.time_until_next_action();

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.shared.metrics.record_message_received();
                            self.handle_text(text.as_str(), &mut heartbeat);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("[WS-{}] Ignoring binary frame ({} bytes)", self.endpoint, data.len());
                        }
                        Some(Ok(Message::Ping(_))) => {
                            trace!("[WS-{}] Received protocol ping", self.endpoint);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_pong_received();
                            self.shared.metrics.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            // Flush the close reply tungstenite queued for us
                            let _ = write.close().await;
                            return SessionEnd::Closed(code);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            warn!("[WS-{}] WebSocket error: {}", self.endpoint, e);
                            return SessionEnd::Lost;
                        }
                        None => {
                            debug!("[WS-{}] WebSocket stream ended", self.endpoint);
                            return SessionEnd::Lost;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send(text)) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                warn!("[WS-{}] Failed to send message: {}", self.endpoint, e);
                                return SessionEnd::Lost;
                            }
                            self.shared.metrics.record_message_sent();
                        }
                        Some(LinkCommand::Close) | None => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            };
                            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                                debug!("[WS-{}] Close frame not sent: {}", self.endpoint, e);
                            }
                            return SessionEnd::Requested;
                        }
                    }
                }

                _ = tokio::time::sleep(next_heartbeat) => {
                    if heartbeat.check_pong_timeout() {
                        self.shared.metrics.record_heartbeat_failure();
                        warn!(
                            "[WS-{}] Pong timeout (failures: {}, last pong: {:?} ago)",
                            self.endpoint,
                            heartbeat.consecutive_failures(),
                            heartbeat.since_last_pong()
                        );
                        if heartbeat.is_unhealthy() {
                            return SessionEnd::Unhealthy;
                        }
                    }

                    if heartbeat.should_send_ping() {
                        let ping = match Envelope::ping().to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("[WS-{}] Could not encode ping: {}", self.endpoint, e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(ping.into())).await {
                            warn!("[WS-{}] Failed to send ping: {}", self.endpoint, e);
                            return SessionEnd::Lost;
                        }
                        heartbeat.record_ping_sent();
                        self.shared.metrics.record_ping();
                    }
                }
            }
        }
    }

    /// Parse one text frame and route it
    fn handle_text(&self, text: &str, heartbeat: &mut Heartbeat) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.shared.metrics.record_malformed_frame();
                warn!(
                    "[WS-{}] Dropping malformed frame ({}): {}",
                    self.endpoint,
                    e,
                    preview(text)
                );
                return;
            }
        };

        match &envelope.kind {
            EnvelopeKind::Pong => {
                trace!("[WS-{}] Received pong", self.endpoint);
                heartbeat.record_pong_received();
                self.shared.metrics.record_pong();
            }
            EnvelopeKind::ConnectionEstablished => {
                info!("[WS-{}] Server confirmed connection", self.endpoint);
            }
            EnvelopeKind::Ping => {
                trace!("[WS-{}] Ignoring inbound ping envelope", self.endpoint);
            }
            _ => {
                let delivered = self.shared.dispatcher.dispatch(&self.endpoint, &envelope);
                trace!(
                    "[WS-{}] Dispatched '{}' to {} subscribers",
                    self.endpoint,
                    envelope.kind,
                    delivered
                );
            }
        }
    }

    fn settle_open(&mut self, outcome: OpenOutcome) {
        if let Some(tx) = self.opened_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    fn retire(&self) -> bool {
        self.shared.retire(&self.endpoint, self.generation)
    }
}

/// Wait until the link is told to close (or its owner went away).
///
/// Sends can only arrive while connected, so any seen here are stale.
async fn wait_for_close(command_rx: &mut mpsc::Receiver<LinkCommand>) {
    loop {
        match command_rx.recv().await {
            Some(LinkCommand::Send(_)) => trace!("Discarding send queued while not connected"),
            Some(LinkCommand::Close) | None => return,
        }
    }
}

async fn close_quietly(mut ws: WsStream) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    let _ = ws.close(Some(frame)).await;
}

/// First 100 characters of a frame, for logs
fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Hide the token query parameter from logs
fn redact_token(url: &Url) -> String {
    if url.query_pairs().any(|(k, _)| k == "token") {
        let mut redacted = url.clone();
        redacted.set_query(Some("token=***"));
        redacted.to_string()
    } else {
        url.to_string()
    }
}

/// Open a socket, bounded by the configured connect timeout
async fn open_socket(config: &ManagerConfig, url: &Url) -> Result<WsStream, OpenFailure> {
    let attempt = connect_websocket(url, &config.headers);
    let result = match config.connect_timeout {
        Some(limit) => timeout(limit, attempt)
            .await
            .map_err(|_| OpenFailure::Timeout(limit))?,
        None => attempt.await,
    };
    result.map_err(|e| OpenFailure::Transport(failure_reason(e)))
}

/// Reason text without the endpoint prefix `into_error` adds later
fn failure_reason(err: Error) -> String {
    match err {
        Error::ConnectionFailed { reason, .. } => reason,
        other => other.to_string(),
    }
}

/// Connect to a WebSocket URL with custom handshake headers.
async fn connect_websocket(
    url: &Url,
    headers: &[(HeaderName, HeaderValue)],
) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::connection_failed(url.as_str(), "No host in URL"))?;

    let is_tls = url.scheme() == "wss";
    let port = url
        .port_or_known_default()
        .unwrap_or(if is_tls { 443 } else { 80 });

    // Build the WebSocket request
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::connection_failed(host, format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    // WebSocket handshake
    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;

    Ok(ws_stream)
}

/// Resolve and connect a TCP socket
async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::connection_failed(host, format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::connection_failed(host, "No addresses found"))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::connection_failed(host, format!("Failed to create socket: {}", e)))?;

    socket.connect(dest_addr).await.map_err(|e| {
        Error::connection_failed(host, format!("TCP connect to {} failed: {}", dest_addr, e))
    })
}

/// Set TCP options for interactive traffic
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Enable TCP_NODELAY (disable Nagle's algorithm)
    let _ = sock2.set_nodelay(true);

    // Keepalive lets the OS notice dead peers between heartbeats
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
