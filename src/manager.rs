use crate::config::ManagerConfig;
use crate::dispatch::{panic_message, Dispatcher, Subscription};
use crate::endpoint::EndpointClient;
use crate::envelope::{Envelope, Topic};
use crate::error::Error;
use crate::host::{AlertSink, ConnectivityAlert, HostEvent, LogAlerts, NoAuth, TokenProvider};
use crate::link::{Link, LinkCommand, OpenFailure, OpenOutcome};
use crate::metrics::Metrics;
use crate::status::{ConnectionStatus, LinkPhase};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// How long `shutdown` waits for each link task before aborting it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every realtime endpoint of the application.
///
/// Cloning is cheap and every clone drives the same endpoints, so one
/// manager is created at startup and handed to whoever needs it.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync`. Internal state sits behind
/// `parking_lot` locks, which are never held across an `.await` or while
/// user callbacks run.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    host_listener: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the manager and its link tasks.
pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    registry: RwLock<HashMap<String, EndpointEntry>>,
    tokens: RwLock<Arc<dyn TokenProvider>>,
    alerts: RwLock<Arc<dyn AlertSink>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct EndpointEntry {
    status: ConnectionStatus,
    phase: LinkPhase,
    /// Last token passed explicitly to `connect`; cleared by `disconnect`
    token: Option<String>,
    /// Set once `connect` was called; status queries alone leave it false
    requested: bool,
    link: Option<LinkHandle>,
}

/// The manager's side of a running link task
struct LinkHandle {
    generation: u64,
    command_tx: Option<mpsc::Sender<LinkCommand>>,
    opened: watch::Receiver<OpenOutcome>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Ask the task to close. Dropping the only sender also reads as a close.
    fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.try_send(LinkCommand::Close);
        }
    }
}

/// Endpoint names are compared without surrounding slashes
fn normalize_endpoint(endpoint: &str) -> &str {
    endpoint.trim().trim_matches('/')
}

impl Shared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Build `<base_url>/<endpoint>/` with an optional `token` query parameter
    pub(crate) fn endpoint_url(&self, endpoint: &str, token: Option<&str>) -> Result<Url, Error> {
        let name = normalize_endpoint(endpoint);
        if name.is_empty() {
            return Err(Error::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "endpoint name is empty".to_string(),
            });
        }

        let base = self.config.base_url.trim_end_matches('/');
        let mut url =
            Url::parse(&format!("{}/{}/", base, name)).map_err(|e| Error::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// Token for a first open: the explicit one, else the session's
    pub(crate) fn resolve_token(&self, explicit: Option<&str>) -> Option<String> {
        match explicit.filter(|t| !t.is_empty()) {
            Some(token) => Some(token.to_string()),
            None => self.session_token(),
        }
    }

    /// Token for a reopen: a fresh session token wins over the original one
    pub(crate) fn resolve_reconnect_token(&self, explicit: Option<&str>) -> Option<String> {
        self.session_token()
            .or_else(|| explicit.filter(|t| !t.is_empty()).map(str::to_string))
    }

    fn session_token(&self) -> Option<String> {
        let provider = self.tokens.read().clone();
        if provider.is_authenticated() {
            provider.current_token()
        } else {
            None
        }
    }

    pub(crate) fn alert(&self, alert: ConnectivityAlert) {
        let sink = self.alerts.read().clone();
        sink.alert(alert);
    }

    /// Move a link to `phase` and rewrite its status with `update`.
    ///
    /// Refused (returns false) when `generation` is no longer the endpoint's
    /// current link or the endpoint is being disconnected.
    pub(crate) fn transition(
        &self,
        endpoint: &str,
        generation: u64,
        phase: LinkPhase,
        update: impl FnOnce(&ConnectionStatus) -> ConnectionStatus,
    ) -> bool {
        let changed = {
            let mut registry = self.registry.write();
            let Some(entry) = registry.get_mut(endpoint) else {
                return false;
            };
            let current = entry.link.as_ref().map(|link| link.generation);
            if current != Some(generation) || entry.phase == LinkPhase::Disconnecting {
                return false;
            }
            entry.phase = phase;
            let next = update(&entry.status);
            if next == entry.status {
                None
            } else {
                entry.status = next.clone();
                Some(next)
            }
        };

        if let Some(status) = changed {
            self.dispatcher.notify_status(endpoint, &status);
        }
        true
    }

    /// Detach a finished link and mark its endpoint disconnected.
    ///
    /// Returns false if the link had already been superseded.
    pub(crate) fn retire(&self, endpoint: &str, generation: u64) -> bool {
        self.retire_with(endpoint, generation, ConnectionStatus::disconnected)
    }

    /// Like [`retire`](Self::retire), with the final status built by `update`
    pub(crate) fn retire_with(
        &self,
        endpoint: &str,
        generation: u64,
        update: impl FnOnce(&ConnectionStatus) -> ConnectionStatus,
    ) -> bool {
        let changed = {
            let mut registry = self.registry.write();
            let Some(entry) = registry.get_mut(endpoint) else {
                return false;
            };
            if entry.link.as_ref().map(|link| link.generation) != Some(generation) {
                return false;
            }
            entry.link = None;
            entry.phase = LinkPhase::Disconnected;
            let next = update(&entry.status);
            if next == entry.status {
                None
            } else {
                entry.status = next.clone();
                Some(next)
            }
        };

        if let Some(status) = changed {
            self.dispatcher.notify_status(endpoint, &status);
        }
        true
    }
}

impl ConnectionManager {
    /// Create a manager. No sockets are opened until `connect` is called.
    pub fn new(config: ManagerConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let shared = Shared {
            config,
            metrics: metrics.clone(),
            dispatcher: Arc::new(Dispatcher::new(metrics)),
            registry: RwLock::new(HashMap::new()),
            tokens: RwLock::new(Arc::new(NoAuth)),
            alerts: RwLock::new(Arc::new(LogAlerts)),
            next_generation: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
                host_listener: Mutex::new(None),
            }),
        }
    }

    /// Use `provider` for tokens on connects that don't pass one, and on every reconnect
    pub fn with_token_provider(self, provider: impl TokenProvider) -> Self {
        *self.inner.shared.tokens.write() = Arc::new(provider);
        self
    }

    /// Send connectivity alerts to `sink` instead of the log
    pub fn with_alerts(self, sink: impl AlertSink) -> Self {
        *self.inner.shared.alerts.write() = Arc::new(sink);
        self
    }

    /// Get the manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.shared.config
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.shared.metrics.clone()
    }

    /// Scope the manager to one endpoint
    pub fn endpoint(&self, name: &str) -> EndpointClient {
        EndpointClient::new(self.clone(), normalize_endpoint(name))
    }

    /// Open `endpoint`, resolving once the socket is open.
    ///
    /// Already connected endpoints return immediately. A call made while a
    /// first open is in flight waits for that open. A call made while the
    /// endpoint waits to reconnect replaces the pending retry.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::InvalidEndpoint`] if the URL can't be built
    /// - [`Error::ConnectionFailed`] / [`Error::ConnectTimeout`] if the open fails
    pub async fn connect(&self, endpoint: &str, token: Option<&str>) -> crate::Result<()> {
        let shared = &self.inner.shared;
        if shared.is_shut_down() {
            return Err(Error::ShuttingDown);
        }

        let name = normalize_endpoint(endpoint);
        shared.endpoint_url(name, None)?;

        let (mut opened, changed) = {
            let mut registry = shared.registry.write();
            let entry = registry.entry(name.to_string()).or_default();
            entry.requested = true;
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                entry.token = Some(token.to_string());
            }

            let in_flight = match (entry.phase, &entry.link) {
                (LinkPhase::Connected, Some(_)) => {
                    trace!("[WS-{}] Already connected", name);
                    return Ok(());
                }
                (LinkPhase::Connecting, Some(link)) => Some(link.opened.clone()),
                _ => None,
            };

            if let Some(opened) = in_flight {
                debug!("[WS-{}] Joining connect already in flight", name);
                (opened, None)
            } else {
                if let Some(mut old) = entry.link.take() {
                    debug!("[WS-{}] Replacing link #{}", name, old.generation);
                    old.close();
                }

                let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
                let (command_tx, command_rx) = mpsc::channel(shared.config.command_buffer);
                let (opened_tx, opened_rx) = watch::channel(OpenOutcome::Pending);
                let link = Link::new(
                    name.to_string(),
                    generation,
                    shared.clone(),
                    entry.token.clone(),
                    command_rx,
                    opened_tx,
                );
                let task = tokio::spawn(run_link_with_recovery(
                    shared.clone(),
                    name.to_string(),
                    generation,
                    link,
                ));

                entry.link = Some(LinkHandle {
                    generation,
                    command_tx: Some(command_tx),
                    opened: opened_rx.clone(),
                    task: Some(task),
                });
                entry.phase = LinkPhase::Connecting;
                entry.status = ConnectionStatus::connecting(&entry.status, 0);
                (opened_rx, Some(entry.status.clone()))
            }
        };

        if let Some(status) = changed {
            shared.dispatcher.notify_status(name, &status);
        }

        let outcome = opened
            .wait_for(|outcome| *outcome != OpenOutcome::Pending)
            .await
            .map(|outcome| outcome.clone())
            .unwrap_or(OpenOutcome::Failed(OpenFailure::Cancelled));

        match outcome {
            OpenOutcome::Opened => Ok(()),
            OpenOutcome::Failed(failure) => Err(failure.into_error(name)),
            OpenOutcome::Pending => Err(OpenFailure::Cancelled.into_error(name)),
        }
    }

    /// Close `endpoint` with code 1000 and cancel any pending reconnect.
    ///
    /// Unknown or already closed endpoints are left alone.
    pub fn disconnect(&self, endpoint: &str) {
        let shared = &self.inner.shared;
        let name = normalize_endpoint(endpoint);

        let changed = {
            let mut registry = shared.registry.write();
            let Some(entry) = registry.get_mut(name) else {
                return;
            };
            entry.token = None;
            match entry.link.as_mut() {
                Some(link) => {
                    link.close();
                    entry.phase = LinkPhase::Disconnecting;
                }
                None => entry.phase = LinkPhase::Disconnected,
            }
            let next = ConnectionStatus::disconnected(&entry.status);
            if next == entry.status {
                None
            } else {
                entry.status = next.clone();
                Some(next)
            }
        };

        if let Some(status) = changed {
            info!("[WS-{}] Disconnected", name);
            shared.dispatcher.notify_status(name, &status);
        }
    }

    /// Queue `envelope` on `endpoint`'s socket.
    ///
    /// Returns false, without buffering, when the endpoint isn't connected,
    /// the envelope has no type, or the outbound queue is full.
    pub fn send(&self, endpoint: &str, envelope: &Envelope) -> bool {
        let shared = &self.inner.shared;
        let name = normalize_endpoint(endpoint);

        if !envelope.has_type() {
            warn!("[WS-{}] Refusing to send an envelope without a type", name);
            shared.metrics.record_send_rejected();
            return false;
        }

        let sender = {
            let registry = shared.registry.read();
            registry
                .get(name)
                .filter(|entry| entry.phase == LinkPhase::Connected)
                .and_then(|entry| entry.link.as_ref())
                .and_then(|link| link.command_tx.clone())
        };
        let Some(tx) = sender else {
            warn!("[WS-{}] Not connected, dropping '{}'", name, envelope.kind);
            shared.metrics.record_send_rejected();
            return false;
        };

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("[WS-{}] Could not encode '{}': {}", name, envelope.kind, e);
                shared.metrics.record_send_rejected();
                return false;
            }
        };

        match tx.try_send(LinkCommand::Send(text)) {
            Ok(()) => {
                trace!("[WS-{}] Queued '{}'", name, envelope.kind);
                true
            }
            Err(e) => {
                warn!("[WS-{}] Failed to queue '{}': {}", name, envelope.kind, e);
                shared.metrics.record_send_rejected();
                false
            }
        }
    }

    /// Call `callback` for every inbound envelope matching `topic`.
    ///
    /// `"*"` (or [`Topic::All`]) receives every non-system envelope, after
    /// the subscribers of its specific type.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .shared
            .dispatcher
            .subscribe(topic.into(), Arc::new(callback))
    }

    /// Call `callback` with `(endpoint, status)` whenever any endpoint's status changes
    pub fn on_connection_status_change(
        &self,
        callback: impl Fn(&str, &ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .shared
            .dispatcher
            .on_status_change(Arc::new(callback))
    }

    /// Number of live subscriptions for `topic`
    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        self.inner.shared.dispatcher.subscriber_count(&topic.into())
    }

    /// Current status of `endpoint`. Unknown endpoints are registered as disconnected.
    pub fn get_connection_status(&self, endpoint: &str) -> ConnectionStatus {
        let name = normalize_endpoint(endpoint);
        if name.is_empty() {
            return ConnectionStatus::default();
        }
        self.inner
            .shared
            .registry
            .write()
            .entry(name.to_string())
            .or_default()
            .status
            .clone()
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.inner
            .shared
            .registry
            .read()
            .get(normalize_endpoint(endpoint))
            .map(|entry| entry.status.connected)
            .unwrap_or(false)
    }

    /// Names of every endpoint the manager has seen, sorted
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.shared.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// React to a network or visibility change reported by the host
    pub async fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Online | HostEvent::Visible => {
                info!("Host reported {:?}, reconnecting idle endpoints", event);
                self.reconnect_idle().await;
            }
            HostEvent::Offline => {
                warn!("Host reported offline");
                self.inner.shared.alert(ConnectivityAlert::Offline);
            }
            HostEvent::Hidden => debug!("Host reported hidden"),
        }
    }

    /// Reconnect every endpoint that was connected at some point and is now
    /// neither connected nor connecting.
    ///
    /// Returns how many reconnected.
    pub async fn reconnect_idle(&self) -> usize {
        if self.inner.shared.is_shut_down() {
            return 0;
        }

        let idle: Vec<(String, Option<String>)> = self
            .inner
            .shared
            .registry
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry.requested && !entry.status.connected && !entry.status.connecting
            })
            .map(|(name, entry)| (name.clone(), entry.token.clone()))
            .collect();
        if idle.is_empty() {
            return 0;
        }
        debug!("Reconnecting {} idle endpoints", idle.len());

        let attempts = idle.iter().map(|(name, token)| async move {
            match self.connect(name, token.as_deref()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("[WS-{}] Reconnect failed: {}", name, e);
                    false
                }
            }
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    /// Feed host events from `events` into [`handle_host_event`](Self::handle_host_event).
    ///
    /// Replaces any listener attached before. The listener stops at
    /// shutdown, when the sender is dropped, or when the manager is dropped.
    pub fn attach_host_events(&self, mut events: mpsc::Receiver<HostEvent>) {
        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.handle_host_event(event).await;
            }
            debug!("Host event listener stopped");
        });

        if let Some(previous) = self.inner.host_listener.lock().replace(listener) {
            previous.abort();
        }
    }

    /// Tear everything down: close every endpoint, wait for link tasks,
    /// drop all subscriptions and observers, and detach host listeners.
    ///
    /// Later `connect` calls fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        let shared = &self.inner.shared;
        if shared.shut_down.swap(true, Ordering::SeqCst) {
            debug!("ConnectionManager already shut down");
            return;
        }
        info!("Shutting down ConnectionManager");

        if let Some(listener) = self.inner.host_listener.lock().take() {
            listener.abort();
        }

        for name in self.endpoints() {
            self.disconnect(&name);
        }

        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut registry = shared.registry.write();
            registry
                .iter_mut()
                .filter_map(|(name, entry)| {
                    let task = entry.link.as_mut()?.task.take()?;
                    Some((name.clone(), task))
                })
                .collect()
        };

        for (name, task) in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("[WS-{}] Link task finished", name),
                Ok(Err(e)) => warn!("[WS-{}] Link task failed: {}", name, e),
                Err(_) => {
                    warn!("[WS-{}] Link task timed out during shutdown", name);
                    abort.abort();
                }
            }
        }

        shared.dispatcher.clear();
        info!("ConnectionManager stopped");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.is_shut_down()
    }
}

/// Run a link, retiring it if it panics
async fn run_link_with_recovery(shared: Arc<Shared>, endpoint: String, generation: u64, link: Link) {
    match AssertUnwindSafe(link.run()).catch_unwind().await {
        Ok(()) => debug!("[WS-{}] Link task completed", endpoint),
        Err(panic_err) => {
            error!(
                "[WS-{}] Link task PANICKED: {}. Endpoint is now disconnected.",
                endpoint,
                panic_message(&panic_err)
            );
            shared.retire(&endpoint, generation);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Abort tasks so nothing outlives the last manager handle
        if let Some(listener) = self.host_listener.get_mut().take() {
            listener.abort();
        }
        let mut registry = self.shared.registry.write();
        for entry in registry.values_mut() {
            if let Some(task) = entry.link.as_mut().and_then(|link| link.task.take()) {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("base_url", &self.inner.shared.config.base_url)
            .field("endpoints", &self.endpoints())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
