//! Stable identifiers.
//!
//! Every record the engine touches is keyed by a UUID newtype so that
//! mention, entity, merge and organization ids can never be swapped by
//! accident at a call site.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns true if this is the nil UUID.
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Nil id, for sentinels and tests.
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Organization scope. Every query and write is confined to one organization.
    OrgId
);

uuid_id!(
    /// Globally unique, stable entity identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use kyro_resolve::EntityId;
    ///
    /// let id = EntityId::new();
    /// assert!(!id.is_nil());
    /// ```
    EntityId
);

uuid_id!(
    /// Identifier of one extracted mention.
    MentionId
);

uuid_id!(
    /// Identifier of one merge history row.
    MergeId
);

/// Identifier of the operator who approved a manual decision.
///
/// Users come from the caller's authorization context, so this is an opaque
/// string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
        assert_ne!(MentionId::new(), MentionId::new());
    }

    #[test]
    fn test_nil() {
        assert!(OrgId::nil().is_nil());
        assert!(!MergeId::new().is_nil());
    }

    #[test]
    fn test_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let id = EntityId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
        assert_eq!(Uuid::from(id), uuid);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = MentionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_user_id_display() {
        let user = UserId::new("ops-7");
        assert_eq!(user.to_string(), "ops-7");
        assert_eq!(user.as_str(), "ops-7");
    }
}
