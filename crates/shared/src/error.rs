use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session is not connected, as published in status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Blocked,
    LoggedOut,
    Conflict,
    Timeout,
    RestartRequired,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPhoneNumber {
    #[error("phone number contains unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("phone number must have between {min} and {max} digits, got {actual}")]
    Length {
        min: usize,
        max: usize,
        actual: usize,
    },
}
