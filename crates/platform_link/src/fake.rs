//! In-memory session library for tests and offline rehearsal.
//!
//! Every `open` creates a [`FakeSessionHandle`] that records the calls made on
//! it; lifecycle events are injected with [`FakeSessionHandle::emit`].

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex, PoisonError,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{Jid, PhoneNumber};
use tokio::sync::{mpsc, Mutex};

use crate::{
    LifecycleEvent, OpenedSession, OutboundPayload, SessionHandle, SessionLibrary,
    SessionOpenRequest,
};

const DEFAULT_PAIRING_CODE: &str = "ABCD-1234";

#[derive(Clone)]
pub struct FakeSessionLibrary {
    inner: Arc<FakeLibraryState>,
}

struct FakeLibraryState {
    open_calls: AtomicUsize,
    open_requests: Mutex<Vec<SessionOpenRequest>>,
    sessions: Mutex<Vec<Arc<FakeSessionHandle>>>,
    pairing_code: Mutex<String>,
    fail_next_open: Mutex<Option<String>>,
    fail_pairing: Mutex<Option<String>>,
}

impl FakeSessionLibrary {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeLibraryState {
                open_calls: AtomicUsize::new(0),
                open_requests: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                pairing_code: Mutex::new(DEFAULT_PAIRING_CODE.to_string()),
                fail_next_open: Mutex::new(None),
                fail_pairing: Mutex::new(None),
            }),
        }
    }

    pub async fn set_pairing_code(&self, code: impl Into<String>) {
        *self.inner.pairing_code.lock().await = code.into();
    }

    pub async fn fail_next_open(&self, message: impl Into<String>) {
        *self.inner.fail_next_open.lock().await = Some(message.into());
    }

    /// Pairing-code requests on sessions opened afterwards fail with `message`.
    pub async fn fail_pairing(&self, message: impl Into<String>) {
        *self.inner.fail_pairing.lock().await = Some(message.into());
    }

    pub fn open_count(&self) -> usize {
        self.inner.open_calls.load(Ordering::SeqCst)
    }

    pub async fn open_requests(&self) -> Vec<SessionOpenRequest> {
        self.inner.open_requests.lock().await.clone()
    }

    pub async fn last_session(&self) -> Option<Arc<FakeSessionHandle>> {
        self.inner.sessions.lock().await.last().cloned()
    }
}

impl Default for FakeSessionLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLibrary for FakeSessionLibrary {
    async fn open(&self, request: SessionOpenRequest) -> Result<OpenedSession> {
        self.inner.open_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.open_requests.lock().await.push(request);

        if let Some(message) = self.inner.fail_next_open.lock().await.take() {
            return Err(anyhow!(message));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeSessionHandle {
            events: StdMutex::new(Some(events_tx)),
            pairing_code: self.inner.pairing_code.lock().await.clone(),
            pairing_failure: self.inner.fail_pairing.lock().await.clone(),
            pairing_requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            logout_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
        });
        self.inner.sessions.lock().await.push(Arc::clone(&handle));

        Ok(OpenedSession {
            handle,
            events: events_rx,
        })
    }
}

pub struct FakeSessionHandle {
    events: StdMutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
    pairing_code: String,
    pairing_failure: Option<String>,
    pairing_requests: Mutex<Vec<PhoneNumber>>,
    sent: Mutex<Vec<(Jid, OutboundPayload)>>,
    logout_calls: AtomicUsize,
    end_calls: AtomicUsize,
}

impl FakeSessionHandle {
    /// Returns `false` once the orchestrator stopped listening to this session.
    pub fn emit(&self, event: LifecycleEvent) -> bool {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Ends the event stream without a `Closed` event, like a library that crashed.
    pub fn hang_up(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub async fn pairing_requests(&self) -> Vec<PhoneNumber> {
        self.pairing_requests.lock().await.clone()
    }

    pub async fn sent(&self) -> Vec<(Jid, OutboundPayload)> {
        self.sent.lock().await.clone()
    }

    pub fn logout_count(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn end_count(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for FakeSessionHandle {
    async fn request_pairing_code(&self, phone: &PhoneNumber) -> Result<String> {
        self.pairing_requests.lock().await.push(phone.clone());
        match &self.pairing_failure {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.pairing_code.clone()),
        }
    }

    async fn send(&self, jid: &Jid, payload: OutboundPayload) -> Result<()> {
        self.sent.lock().await.push((jid.clone(), payload));
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn open_request() -> SessionOpenRequest {
        SessionOpenRequest {
            session_dir: PathBuf::from("auth_info"),
            credentials: None,
        }
    }

    #[tokio::test]
    async fn records_open_calls_and_forwards_injected_events() {
        let library = FakeSessionLibrary::new();
        let mut opened = library.open(open_request()).await.expect("open");
        assert_eq!(library.open_count(), 1);

        let session = library.last_session().await.expect("session");
        assert!(session.emit(LifecycleEvent::SyncComplete));
        assert_eq!(
            opened.events.recv().await,
            Some(LifecycleEvent::SyncComplete)
        );

        drop(opened);
        assert!(!session.emit(LifecycleEvent::SyncComplete));
    }

    #[tokio::test]
    async fn hang_up_ends_the_event_stream() {
        let library = FakeSessionLibrary::new();
        let mut opened = library.open(open_request()).await.expect("open");
        let session = library.last_session().await.expect("session");

        assert!(session.emit(LifecycleEvent::Connecting));
        session.hang_up();

        assert_eq!(opened.events.recv().await, Some(LifecycleEvent::Connecting));
        assert_eq!(opened.events.recv().await, None);
        assert!(!session.emit(LifecycleEvent::SyncComplete));
    }

    #[tokio::test]
    async fn failing_open_still_counts_as_an_attempt() {
        let library = FakeSessionLibrary::new();
        library.fail_next_open("handshake refused").await;

        assert!(library.open(open_request()).await.is_err());
        assert!(library.open(open_request()).await.is_ok());
        assert_eq!(library.open_count(), 2);
    }

    #[tokio::test]
    async fn records_pairing_requests_and_sends() {
        let library = FakeSessionLibrary::new();
        library.set_pairing_code("WXYZ-9876").await;
        let opened = library.open(open_request()).await.expect("open");
        let phone = PhoneNumber::parse("6281234567").expect("phone");

        let code = opened
            .handle
            .request_pairing_code(&phone)
            .await
            .expect("code");
        assert_eq!(code, "WXYZ-9876");

        opened
            .handle
            .send(&Jid::for_phone(&phone), OutboundPayload::Text("hi".into()))
            .await
            .expect("send");

        let session = library.last_session().await.expect("session");
        assert_eq!(session.pairing_requests().await, vec![phone]);
        assert_eq!(session.sent().await.len(), 1);
    }
}
