//! Battle records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{BattleStatus, BattleType};
use crate::ids::{BattleId, PlayerId, TeamId};

/// A battle and its outcome.
///
/// `ended_at` and `duration_ms` are set exactly when the status has
/// left [`BattleStatus::InProgress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleRecord {
    /// Primary key.
    pub id: BattleId,
    /// Encounter kind.
    pub battle_type: BattleType,
    /// Participating players.
    pub participant_ids: Vec<PlayerId>,
    /// Current status.
    pub status: BattleStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once finished.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds, once finished.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Team that fought, for party and dungeon battles.
    #[serde(default)]
    pub team_id: Option<TeamId>,
    /// Dungeon key, for dungeon battles.
    #[serde(default)]
    pub dungeon_id: Option<String>,
    /// Opaque enemy roster.
    #[serde(default)]
    pub enemies: serde_json::Value,
    /// Opaque action log.
    #[serde(default)]
    pub actions: serde_json::Value,
    /// Opaque results (loot, experience, ...).
    #[serde(default)]
    pub results: serde_json::Value,
}

impl BattleRecord {
    /// A new in-progress battle starting now.
    pub fn begin(id: BattleId, battle_type: BattleType, participant_ids: Vec<PlayerId>) -> Self {
        Self {
            id,
            battle_type,
            participant_ids,
            status: BattleStatus::InProgress,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            team_id: None,
            dungeon_id: None,
            enemies: serde_json::Value::Null,
            actions: serde_json::Value::Null,
            results: serde_json::Value::Null,
        }
    }

    /// Close the battle with a terminal `status` at `at`.
    ///
    /// The duration is clamped at zero if `at` precedes the start.
    pub fn close(&mut self, status: BattleStatus, results: serde_json::Value, at: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(at);
        let elapsed = at.signed_duration_since(self.started_at).num_milliseconds();
        self.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));
        self.results = results;
    }

    /// Check record-local invariants.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the record is malformed.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.is_blank() {
            return Err(String::from("battle id must not be empty"));
        }
        let finished = self.ended_at.is_some() || self.duration_ms.is_some();
        if self.status.is_terminal() {
            if self.ended_at.is_none() || self.duration_ms.is_none() {
                return Err(String::from("a finished battle needs an end time and duration"));
            }
        } else if finished {
            return Err(String::from("an in-progress battle cannot carry an end time"));
        }
        Ok(())
    }
}
