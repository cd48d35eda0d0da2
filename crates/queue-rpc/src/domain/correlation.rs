//! Request ID linking a call to its eventual callback.
//!
//! Locally generated ids are UUID v4 strings. Ids received from peers are
//! kept verbatim, whatever their format, so a foreign peer's callback always
//! carries back exactly the token it was sent.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation token carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, globally unique request ID (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing token
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the token parses as a UUID
    pub fn is_uuid(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl From<&str> for RequestId {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_unique() {
        let ids: HashSet<RequestId> = (0..1000).map(|_| RequestId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_generated_id_format() {
        let id = RequestId::generate();
        assert_eq!(id.as_str().len(), 36); // UUID format: 8-4-4-4-12
        assert!(id.is_uuid());
    }

    #[test]
    fn test_foreign_token_kept_verbatim() {
        let id = RequestId::from("1699999999-42");
        assert!(!id.is_uuid());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1699999999-42\"");
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
