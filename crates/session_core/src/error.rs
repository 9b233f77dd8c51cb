use shared::error::InvalidPhoneNumber;
use thiserror::Error;

/// Caller-facing failures. Lifecycle problems are published as status events instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    InvalidPhoneNumber(#[from] InvalidPhoneNumber),
    #[error("session is not connected")]
    NotConnected,
    #[error("pairing code request failed: {0}")]
    PairingCode(String),
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("session orchestrator has stopped")]
    Stopped,
}
