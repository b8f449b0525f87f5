//! Routing keys: caller identities and connection handles.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, caller-supplied identity used as a mailbox address.
///
/// Not validated beyond being non-empty; authentication happens upstream.
/// Deserializing goes through [`Identity::parse`], so an empty string is
/// rejected on the wire as well.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

/// An identity was the empty string.
#[derive(Debug, thiserror::Error)]
#[error("identity must not be empty")]
pub struct EmptyIdentity;

impl Identity {
    /// Accept `raw` as an identity, rejecting the empty string.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        (!raw.is_empty()).then_some(Self(raw))
    }

    /// Borrow the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = EmptyIdentity;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw).ok_or(EmptyIdentity)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique handle for one open connection. Never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate a fresh id (`conn_<uuid v7>`).
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// Borrow the id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identity_rejected() {
        assert!(Identity::parse("").is_none());
    }

    #[test]
    fn identity_is_opaque() {
        let id = Identity::parse("  alice@example ").unwrap();
        assert_eq!(id.as_str(), "  alice@example ");
        assert_eq!(id.to_string(), "  alice@example ");
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id = Identity::parse("bob").unwrap();
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("bob"));
    }

    #[test]
    fn identity_deserialize_rejects_empty() {
        let id: Identity = serde_json::from_value(serde_json::json!("carol")).unwrap();
        assert_eq!(id.as_str(), "carol");

        let err = serde_json::from_value::<Identity>(serde_json::json!("")).unwrap_err();
        assert!(err.to_string().contains("identity must not be empty"));
    }

    #[test]
    fn connection_ids_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }
}
