use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidPhoneNumber;

/// Server part of a user address on the messaging platform.
pub const USER_JID_SERVER: &str = "s.whatsapp.net";

const PHONE_MIN_DIGITS: usize = 8;
const PHONE_MAX_DIGITS: usize = 15;

/// Identifies one `start` .. `closed` lifetime of the underlying session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionAttemptId(pub Uuid);

impl SessionAttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionAttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phone number in international format, digits only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts the usual human formatting (`+62 812-3456-7890`, `(0812) 3456.7890`)
    /// and keeps the digits.
    pub fn parse(raw: &str) -> Result<Self, InvalidPhoneNumber> {
        let mut digits = String::with_capacity(raw.len());
        for ch in raw.trim().chars() {
            match ch {
                '0'..='9' => digits.push(ch),
                '+' | '-' | '.' | '(' | ')' | ' ' => {}
                other => return Err(InvalidPhoneNumber::UnexpectedCharacter(other)),
            }
        }

        if !(PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len()) {
            return Err(InvalidPhoneNumber::Length {
                min: PHONE_MIN_DIGITS,
                max: PHONE_MAX_DIGITS,
                actual: digits.len(),
            });
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PhoneNumber {
    type Err = InvalidPhoneNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = InvalidPhoneNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a chat or user on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn for_phone(phone: &PhoneNumber) -> Self {
        Self(format!("{}@{USER_JID_SERVER}", phone.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
