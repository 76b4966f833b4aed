//! Offline-progress deltas waiting to be applied to a player.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OfflineDataId, PlayerId};

/// A progress delta accrued while the player was offline.
///
/// Once `is_synced` is set it is never cleared again, and the record
/// becomes eligible for retention cleanup after a grace period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineData {
    /// Primary key.
    pub id: OfflineDataId,
    /// Player the delta belongs to.
    pub player_id: PlayerId,
    /// Kind of delta (`gathering_rewards`, `battle_summary`, ...).
    pub data_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Whether the delta has been applied.
    pub is_synced: bool,
    /// When it was applied.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    /// Write counter, incremented by the store on every save.
    #[serde(default)]
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl OfflineData {
    /// A new unsynced delta.
    pub fn new(player_id: PlayerId, data_type: &str, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: OfflineDataId::generate(),
            player_id,
            data_type: data_type.to_owned(),
            payload,
            is_synced: false,
            synced_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check record-local invariants.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the record is malformed.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.is_blank() || self.player_id.is_blank() {
            return Err(String::from("offline data and player ids must not be empty"));
        }
        if self.data_type.trim().is_empty() {
            return Err(String::from("offline data type must not be empty"));
        }
        if self.is_synced && self.synced_at.is_none() {
            return Err(String::from("synced offline data needs a synced timestamp"));
        }
        Ok(())
    }
}
