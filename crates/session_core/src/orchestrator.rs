use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use platform_link::{
    CloseReasonCode, LifecycleEvent, OpenedSession, SessionHandle, SessionLibrary,
    SessionOpenRequest,
};
use serde::Serialize;
use shared::{
    domain::{PhoneNumber, SessionAttemptId},
    error::ErrorKind,
    protocol::{PairingCodeEvent, QrEvent, StatusEvent},
};
use storage::{CredentialBlob, CredentialStore};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    blocking::BlockWindow, dispatcher::StatusDispatcher, error::SessionError,
    sender::OutboundSender,
};

pub const DEFAULT_BLOCK_COOLDOWN: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SYNC_FALLBACK: Duration = Duration::from_secs(10);
pub const DEFAULT_SESSION_DIR: &str = "auth_info";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding the credential blob of this account.
    pub session_dir: PathBuf,
    /// Used for pairing when `start` was called without a phone number.
    pub default_phone: Option<PhoneNumber>,
    pub block_cooldown: Duration,
    /// How long to wait for the sync-complete signal before reporting connected anyway.
    pub sync_fallback: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            default_phone: None,
            block_cooldown: DEFAULT_BLOCK_COOLDOWN,
            sync_fallback: DEFAULT_SYNC_FALLBACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    AwaitingPairing,
    Syncing,
    Connected,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Syncing => "syncing",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic view of the orchestrator, richer than the published status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub attempt: Option<SessionAttemptId>,
    pub identity: Option<String>,
    pub phone: Option<PhoneNumber>,
    pub pairing_requested: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub restart_required_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PairingAttempt {
    requested: bool,
    phone: Option<PhoneNumber>,
}

enum Command {
    Start {
        phone: Option<PhoneNumber>,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ClearSession {
        reply: oneshot::Sender<()>,
    },
    RequestPairingCode {
        phone: PhoneNumber,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    Status {
        reply: oneshot::Sender<StatusEvent>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    ConnectedHandle {
        reply: oneshot::Sender<Option<Arc<dyn SessionHandle>>>,
    },
}

enum Internal {
    Lifecycle {
        attempt: SessionAttemptId,
        event: LifecycleEvent,
    },
    EventsClosed {
        attempt: SessionAttemptId,
    },
    SyncFallback {
        attempt: SessionAttemptId,
    },
    BlockExpired {
        generation: u64,
    },
}

/// Cloneable front of the session owner task.
///
/// Every call is queued to the owner and answered once the owner processed it,
/// so callers observe the same order as the published status events.
#[derive(Clone)]
pub struct SessionOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<StatusDispatcher>,
}

impl SessionOrchestrator {
    /// Spawns the owner task on the current tokio runtime. The task ends when
    /// every clone of the returned orchestrator has been dropped.
    pub fn spawn(
        config: OrchestratorConfig,
        library: Arc<dyn SessionLibrary>,
        store: Arc<dyn CredentialStore>,
        dispatcher: Arc<StatusDispatcher>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            config,
            library,
            store,
            dispatcher: Arc::clone(&dispatcher),
            internal_tx,
            phase: SessionPhase::Idle,
            attempt: None,
            block: BlockWindow::inactive(),
            block_generation: 0,
            block_timer: None,
            pairing: PairingAttempt::default(),
            identity: None,
            last_status: StatusEvent::disconnected("idle"),
            restart_required_count: 0,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));
        Self {
            commands,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<StatusDispatcher> {
        &self.dispatcher
    }

    pub fn sender(&self) -> OutboundSender {
        OutboundSender::new(self.clone())
    }

    /// Never fails because of the session itself; outcomes arrive as status events.
    pub async fn start(&self, phone: Option<&str>) -> Result<(), SessionError> {
        let phone = phone.map(PhoneNumber::parse).transpose()?;
        self.request(|reply| Command::Start { phone, reply }).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn clear_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::ClearSession { reply }).await
    }

    pub async fn request_pairing_code(&self, phone: &str) -> Result<String, SessionError> {
        let phone = PhoneNumber::parse(phone)?;
        self.request(|reply| Command::RequestPairingCode { phone, reply })
            .await?
    }

    pub async fn status(&self) -> Result<StatusEvent, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub(crate) async fn connected_handle(
        &self,
    ) -> Result<Option<Arc<dyn SessionHandle>>, SessionError> {
        self.request(|reply| Command::ConnectedHandle { reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)
    }
}

struct ActiveAttempt {
    id: SessionAttemptId,
    handle: Arc<dyn SessionHandle>,
    forwarder: JoinHandle<()>,
    sync_timer: Option<JoinHandle<()>>,
}

impl ActiveAttempt {
    fn cancel_tasks(&mut self) {
        self.forwarder.abort();
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
    }
}

/// Sole writer of phase, block window and pairing attempt.
struct SessionActor {
    config: OrchestratorConfig,
    library: Arc<dyn SessionLibrary>,
    store: Arc<dyn CredentialStore>,
    dispatcher: Arc<StatusDispatcher>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    phase: SessionPhase,
    attempt: Option<ActiveAttempt>,
    block: BlockWindow,
    block_generation: u64,
    block_timer: Option<JoinHandle<()>>,
    pairing: PairingAttempt,
    identity: Option<String>,
    last_status: StatusEvent,
    restart_required_count: u32,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                Some(event) = internal.recv() => {
                    self.handle_internal(event).await;
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { phone, reply } => {
                self.start(phone).await;
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::ClearSession { reply } => {
                self.clear_session().await;
                let _ = reply.send(());
            }
            Command::RequestPairingCode { phone, reply } => {
                let result = self.request_pairing_code(phone).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.last_status.clone());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::ConnectedHandle { reply } => {
                let handle = match (&self.attempt, self.phase) {
                    (Some(active), SessionPhase::Connected) => Some(Arc::clone(&active.handle)),
                    _ => None,
                };
                let _ = reply.send(handle);
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Lifecycle { attempt, event } => {
                if !self.is_current(attempt) {
                    debug!(attempt = %attempt, ?event, "session: dropping event of a finished attempt");
                    return;
                }
                self.on_lifecycle(attempt, event).await;
            }
            Internal::EventsClosed { attempt } => {
                if self.is_current(attempt) {
                    warn!(attempt = %attempt, "session: library event stream ended without a close");
                    self.on_closed(
                        attempt,
                        CloseReasonCode::Unknown(None),
                        Some("event stream ended".into()),
                    )
                    .await;
                }
            }
            Internal::SyncFallback { attempt } => {
                if self.is_current(attempt) {
                    self.finish_sync(attempt, "fallback timer");
                }
            }
            Internal::BlockExpired { generation } => self.on_block_expired(generation),
        }
    }

    fn is_current(&self, attempt: SessionAttemptId) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|active| active.id == attempt)
    }

    async fn start(&mut self, phone: Option<PhoneNumber>) {
        if !self.block.may_start(Utc::now()) {
            info!(until = ?self.block.until(), "session: start refused while blocked");
            self.publish(
                StatusEvent::disconnected("blocked by platform, retry later")
                    .with_error(ErrorKind::Blocked),
            );
            return;
        }
        if self.block.is_active() {
            debug!("session: block window elapsed before its timer fired");
            self.clear_block();
        }

        if self.phase != SessionPhase::Idle {
            debug!(phase = %self.phase, "session: start ignored, attempt already running");
            let current = self.last_status.clone();
            self.dispatcher.publish_status(&current);
            return;
        }

        let attempt = SessionAttemptId::new();
        self.phase = SessionPhase::Starting;
        self.pairing = PairingAttempt {
            requested: false,
            phone,
        };

        let credentials = match self.store.load(&self.config.session_dir).await {
            Ok(credentials) => credentials,
            Err(err) => {
                error!(attempt = %attempt, "session: failed to load credentials: {err:#}");
                self.phase = SessionPhase::Idle;
                self.publish(
                    StatusEvent::disconnected(format!("failed to load credentials: {err}"))
                        .with_error(ErrorKind::Unknown),
                );
                return;
            }
        };
        info!(
            attempt = %attempt,
            dir = %self.config.session_dir.display(),
            resumed = credentials.is_some(),
            "session: starting"
        );

        let request = SessionOpenRequest {
            session_dir: self.config.session_dir.clone(),
            credentials,
        };
        let OpenedSession { handle, events } = match self.library.open(request).await {
            Ok(opened) => opened,
            Err(err) => {
                error!(attempt = %attempt, "session: failed to open: {err:#}");
                self.phase = SessionPhase::Idle;
                self.publish(
                    StatusEvent::disconnected(format!("failed to open session: {err}"))
                        .with_error(ErrorKind::Unknown),
                );
                return;
            }
        };

        let forwarder = spawn_forwarder(attempt, events, self.internal_tx.clone());
        self.attempt = Some(ActiveAttempt {
            id: attempt,
            handle,
            forwarder,
            sync_timer: None,
        });
        self.publish(StatusEvent::disconnected("connecting"));
    }

    async fn stop(&mut self) {
        match self.release_attempt() {
            Some(handle) => {
                if let Err(err) = handle.end().await {
                    warn!("session: failed to end session cleanly: {err:#}");
                }
                info!("session: stopped, credentials kept");
            }
            None => debug!("session: stop without an open session"),
        }
        self.publish(
            StatusEvent::disconnected("closed, session preserved")
                .with_identity(self.identity.clone()),
        );
    }

    async fn clear_session(&mut self) {
        if let Some(handle) = self.release_attempt() {
            if let Err(err) = handle.logout().await {
                warn!("session: remote logout failed: {err:#}");
            }
        }
        self.delete_credentials().await;
        self.clear_block();
        self.pairing = PairingAttempt::default();
        self.identity = None;
        self.restart_required_count = 0;
        info!("session: cleared");
        self.publish(StatusEvent::disconnected("session cleared"));
    }

    async fn request_pairing_code(&mut self, phone: PhoneNumber) -> Result<String, SessionError> {
        if self.attempt.is_none() {
            return Err(SessionError::InvalidState(
                "no session is open; call start first".into(),
            ));
        }
        if self.pairing.requested {
            return Err(SessionError::InvalidState(
                "a pairing code was already requested for this session attempt".into(),
            ));
        }
        if self.phase != SessionPhase::Starting {
            return Err(SessionError::InvalidState(format!(
                "cannot request a pairing code while {}",
                self.phase
            )));
        }
        self.issue_pairing_code(phone).await
    }

    async fn on_lifecycle(&mut self, attempt: SessionAttemptId, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connecting => {
                debug!(attempt = %attempt, "session: library connecting");
            }
            LifecycleEvent::PairingChallenge { qr_payload } => {
                self.on_pairing_challenge(attempt, qr_payload).await;
            }
            LifecycleEvent::Open { identity } => self.on_open(attempt, identity),
            LifecycleEvent::SyncComplete => self.finish_sync(attempt, "sync complete"),
            LifecycleEvent::CredentialsUpdated(blob) => {
                self.persist_credentials(attempt, blob).await;
            }
            LifecycleEvent::Closed { reason, message } => {
                self.on_closed(attempt, reason, message).await;
            }
        }
    }

    async fn on_pairing_challenge(&mut self, attempt: SessionAttemptId, qr_payload: Option<String>) {
        if let Some(payload) = qr_payload {
            self.dispatcher.publish_qr(&QrEvent { payload });
        }

        if self.pairing.requested {
            debug!(attempt = %attempt, "session: pairing code already requested this attempt");
            return;
        }
        if self.phase != SessionPhase::Starting {
            debug!(attempt = %attempt, phase = %self.phase, "session: pairing challenge ignored");
            return;
        }

        let Some(phone) = self
            .pairing
            .phone
            .clone()
            .or_else(|| self.config.default_phone.clone())
        else {
            warn!(attempt = %attempt, "session: pairing challenge without a phone number");
            self.publish(
                StatusEvent::disconnected("phone number required for pairing code")
                    .with_error(ErrorKind::Unknown),
            );
            return;
        };

        // Failures are already published as status.
        let _ = self.issue_pairing_code(phone).await;
    }

    /// Consumes the single pairing-code request of this attempt, even on failure.
    async fn issue_pairing_code(&mut self, phone: PhoneNumber) -> Result<String, SessionError> {
        let Some(active) = self.attempt.as_ref() else {
            return Err(SessionError::InvalidState("no session is open".into()));
        };
        let attempt = active.id;
        let handle = Arc::clone(&active.handle);

        self.pairing.requested = true;
        self.pairing.phone = Some(phone.clone());

        match handle.request_pairing_code(&phone).await {
            Ok(code) => {
                info!(attempt = %attempt, %phone, "session: pairing code issued");
                self.phase = SessionPhase::AwaitingPairing;
                self.dispatcher.publish_pairing_code(&PairingCodeEvent {
                    code: code.clone(),
                    phone,
                });
                self.publish(StatusEvent::disconnected("awaiting pairing"));
                Ok(code)
            }
            Err(err) => {
                warn!(attempt = %attempt, %phone, "session: pairing code request failed: {err:#}");
                self.publish(
                    StatusEvent::disconnected(format!("pairing code request failed: {err}"))
                        .with_error(ErrorKind::Unknown),
                );
                Err(SessionError::PairingCode(err.to_string()))
            }
        }
    }

    fn on_open(&mut self, attempt: SessionAttemptId, identity: String) {
        if !matches!(
            self.phase,
            SessionPhase::Starting | SessionPhase::AwaitingPairing
        ) {
            debug!(attempt = %attempt, phase = %self.phase, "session: repeated open ignored");
            return;
        }

        self.phase = SessionPhase::Syncing;
        if self.block.is_active() {
            self.clear_block();
        }
        info!(attempt = %attempt, %identity, "session: open, waiting for initial sync");
        self.identity = Some(identity);

        let timer = spawn_timer(
            self.config.sync_fallback,
            self.internal_tx.clone(),
            Internal::SyncFallback { attempt },
        );
        if let Some(previous) = self
            .attempt
            .as_mut()
            .and_then(|active| active.sync_timer.replace(timer))
        {
            previous.abort();
        }
        self.publish(StatusEvent::syncing());
    }

    /// Only the first trigger while syncing has an effect.
    fn finish_sync(&mut self, attempt: SessionAttemptId, trigger: &'static str) {
        if self.phase != SessionPhase::Syncing {
            debug!(attempt = %attempt, trigger, phase = %self.phase, "session: sync trigger ignored");
            return;
        }

        self.phase = SessionPhase::Connected;
        if let Some(timer) = self
            .attempt
            .as_mut()
            .and_then(|active| active.sync_timer.take())
        {
            timer.abort();
        }
        info!(attempt = %attempt, trigger, "session: connected");
        self.publish(StatusEvent::connected(self.identity.clone()));
    }

    async fn persist_credentials(&mut self, attempt: SessionAttemptId, blob: CredentialBlob) {
        match self.store.save(&self.config.session_dir, &blob).await {
            Ok(()) => debug!(attempt = %attempt, len = blob.len(), "session: credentials persisted"),
            Err(err) => error!(attempt = %attempt, "session: failed to persist credentials: {err:#}"),
        }
    }

    /// Never reconnects: every new attempt comes from an explicit `start`.
    async fn on_closed(
        &mut self,
        attempt: SessionAttemptId,
        reason: CloseReasonCode,
        message: Option<String>,
    ) {
        self.release_attempt();
        info!(
            attempt = %attempt,
            %reason,
            detail = message.as_deref().unwrap_or(""),
            "session: closed"
        );

        let status = match reason {
            CloseReasonCode::PlatformBlocked => {
                self.block = BlockWindow::starting_at(Utc::now(), self.config.block_cooldown);
                self.delete_credentials().await;
                self.identity = None;
                self.schedule_block_expiry();
                warn!(
                    attempt = %attempt,
                    until = ?self.block.until(),
                    "session: platform rejected the connection, starts suppressed"
                );
                StatusEvent::disconnected("blocked by platform").with_error(ErrorKind::Blocked)
            }
            CloseReasonCode::LoggedOut => {
                self.delete_credentials().await;
                self.identity = None;
                StatusEvent::disconnected("logged out, re-pair required")
                    .with_error(ErrorKind::LoggedOut)
            }
            CloseReasonCode::RestartRequired => {
                self.restart_required_count += 1;
                StatusEvent::disconnected("restart required")
                    .with_error(ErrorKind::RestartRequired)
                    .with_identity(self.identity.clone())
            }
            CloseReasonCode::Conflict => {
                StatusEvent::disconnected("session replaced by another client")
                    .with_error(ErrorKind::Conflict)
                    .with_identity(self.identity.clone())
            }
            CloseReasonCode::Timeout => StatusEvent::disconnected("connection timed out")
                .with_error(ErrorKind::Timeout)
                .with_identity(self.identity.clone()),
            CloseReasonCode::Unknown(_) => StatusEvent::disconnected("disconnected")
                .with_error(ErrorKind::Unknown)
                .with_identity(self.identity.clone()),
        };
        self.publish(status);
    }

    fn on_block_expired(&mut self, generation: u64) {
        if generation != self.block_generation || !self.block.is_active() {
            debug!(generation, "session: stale block timer ignored");
            return;
        }
        self.block = BlockWindow::inactive();
        self.block_timer = None;
        info!("session: block window elapsed");
        self.publish(StatusEvent::disconnected("unblocked, start may be retried"));
    }

    fn schedule_block_expiry(&mut self) {
        self.block_generation += 1;
        if let Some(timer) = self.block_timer.take() {
            timer.abort();
        }
        self.block_timer = Some(spawn_timer(
            self.config.block_cooldown,
            self.internal_tx.clone(),
            Internal::BlockExpired {
                generation: self.block_generation,
            },
        ));
    }

    fn clear_block(&mut self) {
        self.block = BlockWindow::inactive();
        self.block_generation += 1;
        if let Some(timer) = self.block_timer.take() {
            timer.abort();
        }
    }

    /// Drops the current attempt and returns to idle. Events still queued for it become stale.
    fn release_attempt(&mut self) -> Option<Arc<dyn SessionHandle>> {
        self.phase = SessionPhase::Idle;
        let mut active = self.attempt.take()?;
        active.cancel_tasks();
        Some(active.handle)
    }

    async fn delete_credentials(&self) {
        if let Err(err) = self.store.delete(&self.config.session_dir).await {
            error!(
                dir = %self.config.session_dir.display(),
                "session: failed to delete credentials: {err:#}"
            );
        }
    }

    fn publish(&mut self, mut status: StatusEvent) {
        match self.block.until().filter(|_| self.block.is_active()) {
            Some(until) => status = status.blocked_until(until),
            None => {
                status.blocked = false;
                status.retry_at = None;
            }
        }
        self.last_status = status.clone();
        self.dispatcher.publish_status(&status);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            attempt: self.attempt.as_ref().map(|active| active.id),
            identity: self.identity.clone(),
            phone: self.pairing.phone.clone(),
            pairing_requested: self.pairing.requested,
            blocked_until: self.block.until().filter(|_| self.block.is_active()),
            restart_required_count: self.restart_required_count,
        }
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.release_attempt() {
            if let Err(err) = handle.end().await {
                warn!("session: failed to end session on shutdown: {err:#}");
            }
        }
        if let Some(timer) = self.block_timer.take() {
            timer.abort();
        }
        info!("session: orchestrator stopped");
    }
}

fn spawn_forwarder(
    attempt: SessionAttemptId,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if internal.send(Internal::Lifecycle { attempt, event }).is_err() {
                return;
            }
        }
        let _ = internal.send(Internal::EventsClosed { attempt });
    })
}

fn spawn_timer(
    delay: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    event: Internal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = internal.send(event);
    })
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
