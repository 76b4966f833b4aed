//! Parties of players.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::TeamStatus;
use crate::ids::{BattleId, PlayerId, TeamId};

/// Maximum number of members a team can hold.
pub const MAX_TEAM_SIZE: usize = 5;

/// A party of players led by a captain.
///
/// The captain is always a member, members are unique, and the member
/// count never exceeds [`MAX_TEAM_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Primary key.
    pub id: TeamId,
    /// Display name.
    pub name: String,
    /// Leading member.
    pub captain_id: PlayerId,
    /// Members in join order; includes the captain.
    pub member_ids: Vec<PlayerId>,
    /// Lifecycle state.
    pub status: TeamStatus,
    /// Battle the team is currently fighting, if any.
    #[serde(default)]
    pub current_battle_id: Option<BattleId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Team {
    /// A new active team whose only member is its captain.
    pub fn new(id: TeamId, name: &str, captain_id: PlayerId) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_owned(),
            member_ids: vec![captain_id.clone()],
            captain_id,
            status: TeamStatus::Active,
            current_battle_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `player_id` is a member.
    pub fn has_member(&self, player_id: &PlayerId) -> bool {
        self.member_ids.contains(player_id)
    }

    /// Add a member unless the team is full, disbanded, or already has them.
    ///
    /// Returns `false` and leaves the team untouched when rejected.
    pub fn add_member(&mut self, player_id: PlayerId) -> bool {
        if !self.status.is_live()
            || self.member_ids.len() >= MAX_TEAM_SIZE
            || self.has_member(&player_id)
        {
            return false;
        }
        self.member_ids.push(player_id);
        self.updated_at = Utc::now();
        true
    }

    /// Remove a non-captain member. Returns whether anything changed.
    pub fn remove_member(&mut self, player_id: &PlayerId) -> bool {
        if *player_id == self.captain_id {
            return false;
        }
        let before = self.member_ids.len();
        self.member_ids.retain(|m| m != player_id);
        let changed = self.member_ids.len() != before;
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Check record-local invariants.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the record is malformed.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.is_blank() {
            return Err(String::from("team id must not be empty"));
        }
        if self.member_ids.len() > MAX_TEAM_SIZE {
            return Err(format!(
                "team has {} members, the maximum is {MAX_TEAM_SIZE}",
                self.member_ids.len()
            ));
        }
        if !self.has_member(&self.captain_id) {
            return Err(String::from("the captain must be a team member"));
        }
        let mut seen = std::collections::BTreeSet::new();
        if !self.member_ids.iter().all(|m| seen.insert(m)) {
            return Err(String::from("team members must be unique"));
        }
        Ok(())
    }
}
