//! Boundary-validated identities.
//!
//! # Responsibility
//! - Validate caller-supplied peer identifiers once, at the boundary.
//! - Wrap the opaque authenticated user identifier handed in by the
//!   authentication collaborator.
//!
//! # Invariants
//! - A `PeerId` is non-empty, at most `MAX_PEER_ID_LEN` chars and uses only
//!   `[A-Za-z0-9_.:-]`.
//! - A `UserId` is non-empty, at most `MAX_USER_ID_LEN` chars and contains no
//!   control characters.
//! - Both are trimmed before validation and stored trimmed.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_PEER_ID_LEN: usize = 128;
pub const MAX_USER_ID_LEN: usize = 256;

/// Identity validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    EmptyPeerId,
    PeerIdTooLong(usize),
    InvalidPeerIdChar(char),
    EmptyUserId,
    UserIdTooLong(usize),
    InvalidUserIdChar,
}

impl Display for IdentityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPeerId => write!(f, "peer id cannot be empty"),
            Self::PeerIdTooLong(len) => write!(
                f,
                "peer id is {len} chars long; maximum is {MAX_PEER_ID_LEN}"
            ),
            Self::InvalidPeerIdChar(c) => write!(f, "peer id contains invalid character `{c}`"),
            Self::EmptyUserId => write!(f, "user id cannot be empty"),
            Self::UserIdTooLong(len) => write!(
                f,
                "user id is {len} chars long; maximum is {MAX_USER_ID_LEN}"
            ),
            Self::InvalidUserIdChar => write!(f, "user id contains control characters"),
        }
    }
}

impl Error for IdentityError {}

/// Identifier of one replica.
///
/// There is no registration step: the first request carrying a new `PeerId`
/// implicitly registers it in the peer ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::EmptyPeerId);
        }
        let len = trimmed.chars().count();
        if len > MAX_PEER_ID_LEN {
            return Err(IdentityError::PeerIdTooLong(len));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
        {
            return Err(IdentityError::InvalidPeerIdChar(bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

/// Opaque authenticated user identifier (tenant / owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::EmptyUserId);
        }
        let len = trimmed.chars().count();
        if len > MAX_USER_ID_LEN {
            return Err(IdentityError::UserIdTooLong(len));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(IdentityError::InvalidUserIdChar);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}
