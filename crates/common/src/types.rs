//! Identifiers used throughout the calls cluster.
//!
//! All identifiers are opaque strings assigned by collaborators (the host
//! assigns user and session ids, clients pick call ids, operators pick node
//! ids). They are wrapped in newtypes so a `CallId` can never be passed where
//! a `SessionId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the wrapper and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of one server process participating in the cluster.
    NodeId
);

string_id!(
    /// Identifier of a live call.
    CallId
);

string_id!(
    /// Identifier of one client connection (a user may hold several).
    SessionId
);

string_id!(
    /// Identifier of a host user account.
    UserId
);

impl NodeId {
    /// Generate a node id of the form `{prefix}-{hostname}-{8 hex chars}`.
    #[must_use]
    pub fn generate(prefix: &str, hostname: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let short = suffix.get(..8).unwrap_or("00000000");
        Self(format!("{prefix}-{hostname}-{short}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_as_str_agree() {
        let call = CallId::new("call-1");
        assert_eq!(call.to_string(), "call-1");
        assert_eq!(call.as_str(), "call-1");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let session = SessionId::from("sess-42");
        let json = serde_json::to_string(&session).unwrap();
        assert_eq!(json, "\"sess-42\"");

        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_generated_node_id_shape() {
        let node = NodeId::generate("calls", "host-a");
        let s = node.as_str();
        assert!(s.starts_with("calls-host-a-"));
        assert_eq!(s.len(), "calls-host-a-".len() + 8);
    }

    #[test]
    fn test_node_ids_order_lexicographically() {
        let a = NodeId::from("node-a");
        let b = NodeId::from("node-b");
        assert!(a < b);
    }
}
