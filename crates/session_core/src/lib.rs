//! Lifecycle of one authenticated session with the messaging platform.
//!
//! [`SessionOrchestrator`] owns the session and decides when the external
//! library may be opened. Status changes are fanned out through a
//! [`StatusDispatcher`]; outbound messages go through an [`OutboundSender`].

pub mod blocking;
pub mod dispatcher;
pub mod error;
mod orchestrator;
pub mod sender;

pub use blocking::BlockWindow;
pub use dispatcher::{EventKind, StatusDispatcher, SubscriptionId};
pub use error::SessionError;
pub use orchestrator::{
    OrchestratorConfig, SessionOrchestrator, SessionPhase, SessionSnapshot,
    DEFAULT_BLOCK_COOLDOWN, DEFAULT_SESSION_DIR, DEFAULT_SYNC_FALLBACK,
};
pub use sender::OutboundSender;
