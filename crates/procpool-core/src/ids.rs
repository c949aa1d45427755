//! Identifier types for procpool.
//!
//! Worker IDs are generated by the pool each time a process is spawned, so a
//! replacement worker never shares an identity with the worker it replaces.
//! Session IDs are supplied by callers and only ever used for correlation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum accepted length of a caller-supplied session identifier.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// A 16-byte worker identifier based on UUID v4.
///
/// A fresh ID is generated for every spawned worker process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    /// Generate a new random `WorkerId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Return the first eight hex characters, for compact log lines.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl FromStr for WorkerId {
    type Err = IdError;

    /// Parse a `WorkerId` from a UUID string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0.to_string()
    }
}

/// A caller-supplied session identifier.
///
/// Sessions carry no scheduling weight; the ID is used for observability and
/// log correlation only.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a `SessionId`, rejecting empty or oversized values.
    ///
    /// # Errors
    ///
    /// Returns `IdError::Empty` for blank input and `IdError::InvalidLength`
    /// when the value exceeds [`MAX_SESSION_ID_LEN`] bytes.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_SESSION_ID_LEN {
            return Err(IdError::InvalidLength {
                max: MAX_SESSION_ID_LEN,
                got: value.len(),
            });
        }
        Ok(Self(value))
    }

    /// Return the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// The input is empty or whitespace.
    #[error("identifier must not be empty")]
    Empty,

    /// The input is longer than allowed.
    #[error("identifier too long: max {max} bytes, got {got}")]
    InvalidLength {
        /// The maximum number of bytes.
        max: usize,
        /// The actual number of bytes.
        got: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_roundtrip() {
        let id = WorkerId::generate();
        let parsed = WorkerId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn worker_id_unique() {
        assert_ne!(WorkerId::generate(), WorkerId::generate());
    }

    #[test]
    fn worker_id_short_prefix() {
        let id = WorkerId::generate();
        let short = id.short();
        assert_eq!(short.len(), 8);
        assert!(id.as_uuid().simple().to_string().starts_with(&short));
    }

    #[test]
    fn worker_id_invalid_uuid() {
        let result = WorkerId::from_str("not-a-uuid");
        assert!(matches!(result, Err(IdError::InvalidUuid)));
    }

    #[test]
    fn worker_id_serde_json() {
        let id = WorkerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: WorkerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_id_accepts_arbitrary_text() {
        let id = SessionId::new("user-42/chat").unwrap();
        assert_eq!(id.as_str(), "user-42/chat");
        assert_eq!(id.to_string(), "user-42/chat");
    }

    #[test]
    fn session_id_rejects_empty() {
        assert_eq!(SessionId::new("   "), Err(IdError::Empty));
        assert_eq!(SessionId::new(""), Err(IdError::Empty));
    }

    #[test]
    fn session_id_rejects_oversized() {
        let long = "x".repeat(MAX_SESSION_ID_LEN + 1);
        assert!(matches!(
            SessionId::new(long),
            Err(IdError::InvalidLength { .. })
        ));
    }

    #[test]
    fn session_id_serde_rejects_empty() {
        let parsed: Result<SessionId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }
}
