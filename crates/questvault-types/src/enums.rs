//! Enumeration types shared by the entity model and the wire projections.
//!
//! Enums that are persisted as `TEXT` columns carry a stable
//! [`as_str`](UserRole::as_str) / `parse` pair so the relational schema
//! never depends on `Debug` formatting.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Generates `as_str` and `parse` for a fieldless enum with fixed
/// database spellings.
macro_rules! db_text {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable text spelling used in persisted columns.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Parse the stable text spelling (case-insensitive).
            pub fn parse(text: &str) -> Option<Self> {
                $(
                    if text.eq_ignore_ascii_case($text) {
                        return Some(Self::$variant);
                    }
                )+
                None
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Authorization role attached to a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum UserRole {
    /// Regular player account.
    Player,
    /// Community moderator.
    Moderator,
    /// Operator with full administrative access.
    Admin,
}

db_text!(UserRole {
    Player => "player",
    Moderator => "moderator",
    Admin => "admin",
});

/// Lifecycle state of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum TeamStatus {
    /// Formed and idle.
    Active,
    /// Currently fighting (see `Team::current_battle_id`).
    InBattle,
    /// Dissolved; members are free to join other teams.
    Disbanded,
}

db_text!(TeamStatus {
    Active => "active",
    InBattle => "in_battle",
    Disbanded => "disbanded",
});

impl TeamStatus {
    /// Whether the team still holds its members (anything but disbanded).
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Disbanded)
    }
}

/// Status of a battle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum BattleStatus {
    /// The battle is still running.
    InProgress,
    /// The battle finished normally.
    Completed,
    /// The battle was abandoned before finishing.
    Aborted,
}

db_text!(BattleStatus {
    InProgress => "in_progress",
    Completed => "completed",
    Aborted => "aborted",
});

impl BattleStatus {
    /// Whether this status ends a battle.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Kind of encounter a battle record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum BattleType {
    /// A single player against the environment.
    Solo,
    /// A team fighting together.
    Party,
    /// A team run through a dungeon.
    Dungeon,
    /// Players fighting each other.
    Pvp,
}

db_text!(BattleType {
    Solo => "solo",
    Party => "party",
    Dungeon => "dungeon",
    Pvp => "pvp",
});

/// Timed activity a player can be busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum ActionType {
    /// Harvesting a resource node.
    Gathering,
    /// Producing an item from a recipe.
    Crafting,
    /// Fighting an enemy.
    Combat,
    /// Training an attribute or skill.
    Training,
    /// Exploring an area.
    Exploration,
}

db_text!(ActionType {
    Gathering => "gathering",
    Crafting => "crafting",
    Combat => "combat",
    Training => "training",
    Exploration => "exploration",
});

/// Why an action target stopped being the player's current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum ActionEndReason {
    /// Ran to completion.
    Completed,
    /// Stopped explicitly by the player.
    Cancelled,
    /// Replaced by a newer action target for the same player.
    Superseded,
}

db_text!(ActionEndReason {
    Completed => "completed",
    Cancelled => "cancelled",
    Superseded => "superseded",
});

/// Durable entity classes handled by the persistence layer.
///
/// Used to pick cache expiration tiers, batch queues and metric buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum EntityKind {
    /// [`crate::User`].
    User,
    /// [`crate::UserCharacterLink`].
    CharacterLink,
    /// [`crate::Player`].
    Player,
    /// [`crate::Team`].
    Team,
    /// [`crate::ActionTarget`].
    ActionTarget,
    /// [`crate::BattleRecord`].
    BattleRecord,
    /// [`crate::OfflineData`].
    OfflineData,
}

db_text!(EntityKind {
    User => "user",
    CharacterLink => "character_link",
    Player => "player",
    Team => "team",
    ActionTarget => "action_target",
    BattleRecord => "battle_record",
    OfflineData => "offline_data",
});

/// Machine-readable failure class carried in the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum ErrorCode {
    /// The key does not exist.
    NotFound,
    /// A uniqueness or state rule would be violated.
    Conflict,
    /// The input is malformed.
    ValidationError,
    /// The backend could not be reached.
    BackendUnavailable,
    /// A stored payload could not be encoded or decoded.
    SerializationError,
    /// The operation did not finish within its deadline.
    Timeout,
    /// Any other internal failure.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_text_roundtrip_is_case_insensitive() {
        assert_eq!(BattleStatus::parse("IN_PROGRESS"), Some(BattleStatus::InProgress));
        assert_eq!(TeamStatus::parse("in_battle"), Some(TeamStatus::InBattle));
        assert_eq!(ActionType::parse("Crafting"), Some(ActionType::Crafting));
        assert_eq!(UserRole::parse("root"), None);
    }

    #[test]
    fn terminal_battle_statuses() {
        assert!(!BattleStatus::InProgress.is_terminal());
        assert!(BattleStatus::Completed.is_terminal());
        assert!(BattleStatus::Aborted.is_terminal());
    }

    #[test]
    fn disbanded_teams_are_not_live() {
        assert!(TeamStatus::Active.is_live());
        assert!(TeamStatus::InBattle.is_live());
        assert!(!TeamStatus::Disbanded.is_live());
    }

    #[test]
    fn display_uses_db_spelling() {
        assert_eq!(EntityKind::ActionTarget.to_string(), "action_target");
        assert_eq!(ActionEndReason::Superseded.to_string(), "superseded");
    }
}
