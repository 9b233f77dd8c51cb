use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use shared::protocol::{PairingCodeEvent, PushEvent, QrEvent, StatusEvent};
use tokio::sync::broadcast;
use tracing::{error, warn};

const PUSH_CHANNEL_CAPACITY: usize = 256;

type Listener<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Qr,
    PairingCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

impl SubscriptionId {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Registry<E> {
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

impl<E> Registry<E> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, id: u64, listener: Listener<E>) {
        self.lock().push((id, listener));
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> Vec<(u64, Listener<E>)> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<E>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fans session events out to registered listeners and to the push channel.
///
/// Listeners run synchronously in registration order. A listener that fails
/// or panics is logged and skipped; the remaining listeners still run.
pub struct StatusDispatcher {
    next_id: AtomicU64,
    status: Registry<StatusEvent>,
    qr: Registry<QrEvent>,
    pairing_code: Registry<PairingCodeEvent>,
    push: broadcast::Sender<PushEvent>,
}

impl StatusDispatcher {
    pub fn new() -> Self {
        let (push, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            status: Registry::new(),
            qr: Registry::new(),
            pairing_code: Registry::new(),
            push,
        }
    }

    pub fn subscribe_status<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate(EventKind::Status);
        self.status.insert(id.id, Arc::new(listener));
        id
    }

    pub fn subscribe_qr<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QrEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate(EventKind::Qr);
        self.qr.insert(id.id, Arc::new(listener));
        id
    }

    pub fn subscribe_pairing_code<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PairingCodeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate(EventKind::PairingCode);
        self.pairing_code.insert(id.id, Arc::new(listener));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        match subscription.kind {
            EventKind::Status => self.status.remove(subscription.id),
            EventKind::Qr => self.qr.remove(subscription.id),
            EventKind::PairingCode => self.pairing_code.remove(subscription.id),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Status => self.status.len(),
            EventKind::Qr => self.qr.len(),
            EventKind::PairingCode => self.pairing_code.len(),
        }
    }

    pub fn subscribe_push(&self) -> broadcast::Receiver<PushEvent> {
        self.push.subscribe()
    }

    pub fn publish_status(&self, event: &StatusEvent) {
        fan_out(EventKind::Status, &self.status, event);
        let _ = self.push.send(PushEvent::Status(event.clone()));
    }

    pub fn publish_qr(&self, event: &QrEvent) {
        fan_out(EventKind::Qr, &self.qr, event);
        let _ = self.push.send(PushEvent::Qr(event.clone()));
    }

    pub fn publish_pairing_code(&self, event: &PairingCodeEvent) {
        fan_out(EventKind::PairingCode, &self.pairing_code, event);
        let _ = self.push.send(PushEvent::PairingCode(event.clone()));
    }

    fn allocate(&self, kind: EventKind) -> SubscriptionId {
        SubscriptionId {
            kind,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for StatusDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// Listeners are invoked outside the registry lock so they may unsubscribe themselves.
fn fan_out<E>(kind: EventKind, registry: &Registry<E>, event: &E) {
    for (id, listener) in registry.snapshot() {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(?kind, listener = id, "dispatcher: listener failed: {err:#}");
            }
            Err(_) => {
                error!(?kind, listener = id, "dispatcher: listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use shared::domain::PhoneNumber;

    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let dispatcher = StatusDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe_status(move |event| {
                seen.lock()
                    .expect("lock")
                    .push(format!("{name}:{}", event.message.as_deref().unwrap_or("")));
                Ok(())
            });
        }

        dispatcher.publish_status(&StatusEvent::disconnected("connecting"));

        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["first:connecting", "second:connecting", "third:connecting"]
        );
    }

    #[test]
    fn failing_and_panicking_listeners_do_not_stop_fan_out() {
        let dispatcher = StatusDispatcher::new();
        let delivered = Arc::new(Mutex::new(0usize));

        dispatcher.subscribe_status(|_| Err(anyhow!("socket gone")));
        dispatcher.subscribe_status(|_| panic!("listener bug"));
        {
            let delivered = Arc::clone(&delivered);
            dispatcher.subscribe_status(move |_| {
                *delivered.lock().expect("lock") += 1;
                Ok(())
            });
        }

        dispatcher.publish_status(&StatusEvent::syncing());
        dispatcher.publish_status(&StatusEvent::connected(None));

        assert_eq!(*delivered.lock().expect("lock"), 2);
    }

    #[test]
    fn unsubscribe_removes_only_the_matching_kind() {
        let dispatcher = StatusDispatcher::new();
        let status = dispatcher.subscribe_status(|_| Ok(()));
        let qr = dispatcher.subscribe_qr(|_| Ok(()));

        assert!(dispatcher.unsubscribe(status));
        assert!(!dispatcher.unsubscribe(status));
        assert_eq!(dispatcher.listener_count(EventKind::Status), 0);
        assert_eq!(dispatcher.listener_count(EventKind::Qr), 1);
        assert_eq!(qr.kind(), EventKind::Qr);
    }

    #[test]
    fn listener_may_unsubscribe_itself_while_being_invoked() {
        let dispatcher = Arc::new(StatusDispatcher::new());
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));
        let calls = Arc::new(Mutex::new(0usize));

        let id = {
            let handle = Arc::clone(&dispatcher);
            let own_id = Arc::clone(&own_id);
            let calls = Arc::clone(&calls);
            dispatcher.subscribe_status(move |_| {
                *calls.lock().expect("lock") += 1;
                if let Some(id) = *own_id.lock().expect("lock") {
                    handle.unsubscribe(id);
                }
                Ok(())
            })
        };
        *own_id.lock().expect("lock") = Some(id);

        dispatcher.publish_status(&StatusEvent::syncing());
        dispatcher.publish_status(&StatusEvent::syncing());

        assert_eq!(*calls.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn mirrors_every_kind_onto_the_push_channel() {
        let dispatcher = StatusDispatcher::new();
        let mut push = dispatcher.subscribe_push();

        dispatcher.publish_qr(&QrEvent {
            payload: "2@abc".into(),
        });
        dispatcher.publish_pairing_code(&PairingCodeEvent {
            code: "ABCD-1234".into(),
            phone: PhoneNumber::parse("6281234567").expect("phone"),
        });
        dispatcher.publish_status(&StatusEvent::connected(Some("me".into())));

        assert!(matches!(push.recv().await, Ok(PushEvent::Qr(_))));
        assert!(matches!(push.recv().await, Ok(PushEvent::PairingCode(_))));
        match push.recv().await {
            Ok(PushEvent::Status(status)) => assert!(status.connected),
            other => panic!("unexpected push event: {other:?}"),
        }
    }
}
