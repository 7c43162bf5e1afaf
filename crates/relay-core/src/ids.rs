//! Branded ID newtypes.
//!
//! Users, connections, executions, threads, and runs are all identified by
//! opaque strings. Wrapping each in its own type prevents handing a user ID
//! to an API that expects a connection ID.
//!
//! Server-generated IDs (`ConnectionId`, `ExecutionId`) are prefixed UUID v7
//! values. IDs that originate elsewhere (`UserId` from the auth service,
//! `ThreadId`/`RunId` from the agent runtime) are taken as given.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new time-ordered ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, Uuid::now_v7()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identity of an end user, as asserted by the external auth service.
    UserId, "user_"
}

branded_id! {
    /// One live transport-level session.
    ConnectionId, "conn_"
}

branded_id! {
    /// One run of an agent, tracked from start to terminal state.
    ExecutionId, "exec_"
}

branded_id! {
    /// Conversation thread an execution belongs to.
    ThreadId, "thread_"
}

branded_id! {
    /// Agent runtime run identifier.
    RunId, "run_"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(ConnectionId::generate().starts_with("conn_"));
        assert!(ExecutionId::generate().starts_with("exec_"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<ExecutionId> = (0..1000).map(|_| ExecutionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn external_ids_kept_verbatim() {
        let user = UserId::from("auth0|12345");
        assert_eq!(user.as_str(), "auth0|12345");
        assert_eq!(user.to_string(), "auth0|12345");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConnectionId::from("conn_abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conn_abc\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut set = HashSet::new();
        let _ = set.insert(UserId::from("u1"));
        assert!(set.contains("u1"));
    }
}
