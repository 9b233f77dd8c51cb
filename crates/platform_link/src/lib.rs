//! Contract of the external session library that speaks the platform protocol.
//!
//! The library owns the handshake, encryption and framing. This crate only
//! describes what the orchestrator needs from it.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use shared::domain::{Jid, PhoneNumber};
use storage::CredentialBlob;
use tokio::sync::mpsc;

pub mod fake;

/// Why the library closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReasonCode {
    /// The platform actively rejected the connection attempt.
    PlatformBlocked,
    /// The remote side revoked the linked device.
    LoggedOut,
    /// Protocol-mandated restart, expected once after the first pairing.
    RestartRequired,
    /// Another client took over the session slot.
    Conflict,
    Timeout,
    Unknown(Option<u16>),
}

impl CloseReasonCode {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 | 405 => Self::PlatformBlocked,
            408 => Self::Timeout,
            440 => Self::Conflict,
            515 => Self::RestartRequired,
            other => Self::Unknown(Some(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlatformBlocked => "platform_blocked",
            Self::LoggedOut => "logged_out",
            Self::RestartRequired => "restart_required",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for CloseReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(Some(code)) => write!(f, "unknown({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connecting,
    /// The platform wants this device linked. May repeat while the library retries.
    PairingChallenge {
        qr_payload: Option<String>,
    },
    Open {
        identity: String,
    },
    /// Initial history/app-state sync finished.
    SyncComplete,
    CredentialsUpdated(CredentialBlob),
    Closed {
        reason: CloseReasonCode,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOpenRequest {
    pub session_dir: PathBuf,
    pub credentials: Option<CredentialBlob>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Binary {
        data: Vec<u8>,
        mime_type: Option<String>,
    },
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn request_pairing_code(&self, phone: &PhoneNumber) -> anyhow::Result<String>;
    async fn send(&self, jid: &Jid, payload: OutboundPayload) -> anyhow::Result<()>;
    /// Unlinks the device on the remote side, then closes.
    async fn logout(&self) -> anyhow::Result<()>;
    /// Closes the connection and keeps the device linked.
    async fn end(&self) -> anyhow::Result<()>;
}

/// A freshly opened session. Events are buffered from the moment of opening.
pub struct OpenedSession {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

#[async_trait]
pub trait SessionLibrary: Send + Sync {
    async fn open(&self, request: SessionOpenRequest) -> anyhow::Result<OpenedSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_platform_status_codes() {
        assert_eq!(
            CloseReasonCode::from_status_code(401),
            CloseReasonCode::LoggedOut
        );
        assert_eq!(
            CloseReasonCode::from_status_code(403),
            CloseReasonCode::PlatformBlocked
        );
        assert_eq!(
            CloseReasonCode::from_status_code(405),
            CloseReasonCode::PlatformBlocked
        );
        assert_eq!(
            CloseReasonCode::from_status_code(408),
            CloseReasonCode::Timeout
        );
        assert_eq!(
            CloseReasonCode::from_status_code(440),
            CloseReasonCode::Conflict
        );
        assert_eq!(
            CloseReasonCode::from_status_code(515),
            CloseReasonCode::RestartRequired
        );
        assert_eq!(
            CloseReasonCode::from_status_code(500),
            CloseReasonCode::Unknown(Some(500))
        );
        assert_eq!(CloseReasonCode::Unknown(Some(500)).to_string(), "unknown(500)");
    }
}
