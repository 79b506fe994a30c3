use crate::envelope::{Envelope, Topic};
use crate::metrics::Metrics;
use crate::status::ConnectionStatus;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

/// Callback invoked for each matching inbound envelope
pub type EnvelopeCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Callback invoked with `(endpoint, status)` on every status change
pub type StatusCallback = Arc<dyn Fn(&str, &ConnectionStatus) + Send + Sync>;

/// Shared dispatch surface: the envelope subscription table plus status observers.
///
/// Callbacks are cloned out of the table before they run, so a callback may
/// subscribe or unsubscribe without deadlocking.
pub(crate) struct Dispatcher {
    next_id: AtomicU64,
    topics: RwLock<HashMap<Topic, HashMap<u64, EnvelopeCallback>>>,
    observers: RwLock<HashMap<u64, StatusCallback>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub(crate) fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            topics: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, topic: Topic, callback: EnvelopeCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("Subscribing #{} to '{}'", id, topic);
        self.topics
            .write()
            .entry(topic.clone())
            .or_default()
            .insert(id, callback);
        Subscription {
            dispatcher: Arc::downgrade(self),
            registration: Registration::Topic(topic, id),
        }
    }

    pub(crate) fn on_status_change(self: &Arc<Self>, callback: StatusCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().insert(id, callback);
        Subscription {
            dispatcher: Arc::downgrade(self),
            registration: Registration::Status(id),
        }
    }

    /// Deliver an envelope to its kind's subscribers, then to wildcard
    /// subscribers. Returns how many callbacks ran to completion.
    pub(crate) fn dispatch(&self, endpoint: &str, envelope: &Envelope) -> usize {
        if envelope.kind.is_system() {
            return 0;
        }

        let callbacks: Vec<EnvelopeCallback> = {
            let topics = self.topics.read();
            let specific = topics.get(&Topic::Kind(envelope.kind.clone()));
            let wildcard = topics.get(&Topic::All);
            specific
                .into_iter()
                .chain(wildcard)
                .flat_map(|subs| subs.values().cloned())
                .collect()
        };

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    self.metrics.record_subscriber_panic();
                    error!(
                        "[WS-{}] Subscriber for '{}' panicked: {}",
                        endpoint,
                        envelope.kind,
                        panic_message(&panic)
                    );
                }
            }
        }
        delivered
    }

    /// Tell every status observer about a change on `endpoint`
    pub(crate) fn notify_status(&self, endpoint: &str, status: &ConnectionStatus) {
        let observers: Vec<StatusCallback> = self.observers.read().values().cloned().collect();
        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(endpoint, status))) {
                self.metrics.record_subscriber_panic();
                error!(
                    "[WS-{}] Status observer panicked: {}",
                    endpoint,
                    panic_message(&panic)
                );
            }
        }
    }

    /// Drop every subscription and observer
    pub(crate) fn clear(&self) {
        self.topics.write().clear();
        self.observers.write().clear();
    }

    pub(crate) fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.read().get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn remove(&self, registration: &Registration) {
        match registration {
            Registration::Topic(topic, id) => {
                let mut topics = self.topics.write();
                if let Some(subs) = topics.get_mut(topic) {
                    subs.remove(id);
                    if subs.is_empty() {
                        topics.remove(topic);
                    }
                }
            }
            Registration::Status(id) => {
                self.observers.write().remove(id);
            }
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[derive(Debug, Clone)]
enum Registration {
    Topic(Topic, u64),
    Status(u64),
}

/// Handle for one registration made with `subscribe` or
/// `on_connection_status_change`.
///
/// Call [`Subscription::unsubscribe`] to remove it. Dropping the handle
/// leaves the registration in place.
#[derive(Debug, Clone)]
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    dispatcher: Weak<Dispatcher>,
    registration: Registration,
}

impl Subscription {
    /// Remove exactly this registration. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(&self.registration);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.topics.read().len())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Arc::new(Metrics::new())))
    }

    fn counter() -> (Arc<AtomicUsize>, EnvelopeCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move |_: &Envelope| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn frame(kind: &str) -> Envelope {
        Envelope::new(kind, None)
    }

    #[test]
    fn test_kind_then_wildcard_delivery() {
        let d = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _a = d.subscribe("new_notification".into(), Arc::new(move |_: &Envelope| s.lock().push("kind")));
        let s = seen.clone();
        let _b = d.subscribe(Topic::All, Arc::new(move |_: &Envelope| s.lock().push("all")));

        assert_eq!(d.dispatch("notifications", &frame("new_notification")), 2);
        assert_eq!(*seen.lock(), vec!["kind", "all"]);
    }

    #[test]
    fn test_system_kinds_reach_nobody() {
        let d = dispatcher();
        let (count, cb) = counter();
        let _all = d.subscribe(Topic::All, cb.clone());
        let _pong = d.subscribe(Topic::Kind(EnvelopeKind::Pong), cb);

        for kind in ["pong", "ping", "connection_established"] {
            assert_eq!(d.dispatch("messaging", &frame(kind)), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_is_targeted_and_idempotent() {
        let d = dispatcher();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        let sub1 = d.subscribe("new_message".into(), cb1);
        let _sub2 = d.subscribe("new_message".into(), cb2);

        sub1.unsubscribe();
        sub1.unsubscribe();
        d.dispatch("messaging", &frame("new_message"));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(d.subscriber_count(&"new_message".into()), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let d = dispatcher();
        let _bad = d.subscribe(
            "new_message".into(),
            Arc::new(|_: &Envelope| panic!("subscriber blew up")),
        );
        let (count, cb) = counter();
        let _good = d.subscribe("new_message".into(), cb);

        assert_eq!(d.dispatch("messaging", &frame("new_message")), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(d.metrics.subscriber_panics(), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let d = dispatcher();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, _) = counter();
        let c = count.clone();
        let s = slot.clone();
        let sub = d.subscribe(
            "user_status".into(),
            Arc::new(move |_: &Envelope| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = s.lock().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        *slot.lock() = Some(sub);

        d.dispatch("messaging", &frame("user_status"));
        d.dispatch("messaging", &frame("user_status"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_observers() {
        let d = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = d.on_status_change(Arc::new(move |endpoint: &str, status: &ConnectionStatus| {
            s.lock().push((endpoint.to_string(), status.connected));
        }));
        let _bad = d.on_status_change(Arc::new(|_: &str, _: &ConnectionStatus| panic!("observer")));

        d.notify_status("messaging", &ConnectionStatus::connected_now());
        sub.unsubscribe();
        d.notify_status("messaging", &ConnectionStatus::default());

        assert_eq!(*seen.lock(), vec![("messaging".to_string(), true)]);
        assert_eq!(d.observer_count(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let d = dispatcher();
        let (count, cb) = counter();
        let _s = d.subscribe(Topic::All, cb);
        let _o = d.on_status_change(Arc::new(|_: &str, _: &ConnectionStatus| {}));

        d.clear();
        d.dispatch("messaging", &frame("new_message"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(d.observer_count(), 0);
    }

    #[test]
    fn test_unsubscribe_after_dispatcher_dropped() {
        let d = dispatcher();
        let (_, cb) = counter();
        let sub = d.subscribe(Topic::All, cb);
        drop(d);
        sub.unsubscribe();
    }
}
