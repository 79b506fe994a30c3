use crate::dispatch::Subscription;
use crate::envelope::{Envelope, EnvelopeKind, Topic};
use crate::manager::ConnectionManager;
use crate::status::ConnectionStatus;
use serde_json::Value;

/// A [`ConnectionManager`] scoped to a single endpoint.
///
/// Feature code that only talks to one endpoint (the messaging view, the
/// notification bell) holds one of these instead of repeating the name.
#[derive(Debug, Clone)]
pub struct EndpointClient {
    manager: ConnectionManager,
    name: String,
}

impl EndpointClient {
    pub(crate) fn new(manager: ConnectionManager, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// See [`ConnectionManager::connect`]
    pub async fn connect(&self, token: Option<&str>) -> crate::Result<()> {
        self.manager.connect(&self.name, token).await
    }

    pub fn disconnect(&self) {
        self.manager.disconnect(&self.name)
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        self.manager.send(&self.name, envelope)
    }

    /// Send `{"type": kind, "data": data}`
    pub fn send_kind(&self, kind: impl Into<EnvelopeKind>, data: Option<Value>) -> bool {
        self.send(&Envelope::new(kind, data))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.get_connection_status(&self.name)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected(&self.name)
    }

    /// Subscribe to `topic`.
    ///
    /// Subscriptions are keyed by envelope type only, so matching envelopes
    /// from other endpoints are delivered too.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.manager.subscribe(topic, callback)
    }

    /// Observe status changes of this endpoint only
    pub fn on_status_change(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let name = self.name.clone();
        self.manager
            .on_connection_status_change(move |endpoint, status| {
                if endpoint == name {
                    callback(status);
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_name_is_normalized() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        assert_eq!(manager.endpoint("/messaging/").name(), "messaging");
    }

    #[test]
    fn test_send_kind_refused_while_disconnected() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let client = manager.endpoint("messaging");

        assert!(!client.send_kind("typing_start", Some(serde_json::json!({"conversation_id": 1}))));
        assert!(!client.is_connected());
        assert_eq!(client.status(), ConnectionStatus::default());
        assert_eq!(manager.metrics().sends_rejected(), 1);
    }

    #[tokio::test]
    async fn test_status_observer_is_scoped() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let messaging = manager.endpoint("messaging");
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        let _sub = messaging.on_status_change(move |_| *c.lock() += 1);

        // Connecting to an invalid endpoint name never reaches observers
        assert!(manager.connect("", None).await.is_err());
        manager.get_connection_status("notifications");
        manager.disconnect("notifications");
        messaging.disconnect();

        assert_eq!(*calls.lock(), 0);
    }
}
