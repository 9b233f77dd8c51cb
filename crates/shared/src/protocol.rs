use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::PhoneNumber, error::ErrorKind};

/// One session status transition. `blocked` and `retry_at` always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub syncing: bool,
}

impl StatusEvent {
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn syncing() -> Self {
        Self {
            message: Some("syncing".into()),
            syncing: true,
            ..Self::default()
        }
    }

    pub fn connected(identity: Option<String>) -> Self {
        Self {
            connected: true,
            identity,
            message: Some("connected".into()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn blocked_until(mut self, until: DateTime<Utc>) -> Self {
        self.blocked = true;
        self.retry_at = Some(until);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrEvent {
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCodeEvent {
    pub code: String,
    pub phone: PhoneNumber,
}

/// Everything the session publishes, shaped for a real-time transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    Status(StatusEvent),
    Qr(QrEvent),
    PairingCode(PairingCodeEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_uses_camel_case_and_omits_absent_fields() {
        let event = StatusEvent::disconnected("connecting");
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(
            value,
            serde_json::json!({
                "connected": false,
                "message": "connecting",
                "blocked": false,
                "syncing": false,
            })
        );
    }

    #[test]
    fn blocked_status_carries_retry_at_and_error_kind() {
        let until: DateTime<Utc> = "2024-01-01T00:10:00Z".parse().expect("timestamp");
        let event = StatusEvent::disconnected("blocked")
            .with_error(ErrorKind::Blocked)
            .blocked_until(until);
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["errorKind"], "blocked");
        assert_eq!(value["retryAt"], "2024-01-01T00:10:00Z");
        assert_eq!(value["blocked"], true);
    }

    #[test]
    fn push_events_are_tagged() {
        let event = PushEvent::PairingCode(PairingCodeEvent {
            code: "ABCD-1234".into(),
            phone: PhoneNumber::parse("6281234567").expect("phone"),
        });
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "pairing_code");
        assert_eq!(value["payload"]["code"], "ABCD-1234");
        assert_eq!(value["payload"]["phone"], "6281234567");

        let decoded: PushEvent = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, event);
    }
}
