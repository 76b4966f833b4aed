//! Type-safe identifier wrappers around opaque string keys.
//!
//! Every durable entity is keyed by an opaque string. Keys generated by
//! the persistence layer are UUID v7 strings (time-ordered), but callers
//! may supply their own keys (e.g. `char-1`) and the layer treats them
//! as opaque. Distinct wrapper types stop a `TeamId` from being passed
//! where a `PlayerId` is expected.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`String`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[serde(transparent)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a fresh UUID v7.
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Borrow the key as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the key is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a user account.
    UserId
}

define_id! {
    /// Unique identifier for a player character.
    PlayerId
}

define_id! {
    /// Unique identifier for a party/team.
    TeamId
}

define_id! {
    /// Unique identifier for a timed action target (gathering, crafting, ...).
    ActionTargetId
}

define_id! {
    /// Unique identifier for a battle record.
    BattleId
}

define_id! {
    /// Unique identifier for an offline-progress delta.
    OfflineDataId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_non_blank() {
        let a = PlayerId::generate();
        let b = PlayerId::generate();
        assert_ne!(a, b);
        assert!(!a.is_blank());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = UserId::from("alice-1");
        let json = serde_json::to_string(&id).ok();
        assert_eq!(json.as_deref(), Some("\"alice-1\""));
    }

    #[test]
    fn blank_detection() {
        assert!(TeamId::from("   ").is_blank());
        assert!(!TeamId::from("t-1").is_blank());
    }

    #[test]
    fn display_matches_inner() {
        let id = BattleId::from("b-42");
        assert_eq!(id.to_string(), "b-42");
        assert_eq!(id.as_str(), "b-42");
    }
}
