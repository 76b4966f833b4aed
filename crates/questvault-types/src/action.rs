//! Timed action targets: what a player is busy doing right now.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::enums::{ActionEndReason, ActionType};
use crate::ids::{ActionTargetId, PlayerId};

/// A player's timed task (gathering a node, crafting a recipe, ...).
///
/// At most one action target per player is incomplete at any time;
/// saving a new incomplete target supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ActionTarget {
    /// Primary key.
    pub id: ActionTargetId,
    /// Player performing the action.
    pub player_id: PlayerId,
    /// Kind of thing targeted (`resource_node`, `recipe`, `monster`, ...).
    pub target_type: String,
    /// Key of the targeted thing.
    pub target_id: String,
    /// Display name of the target.
    #[serde(default)]
    pub target_name: String,
    /// Activity being performed.
    pub action_type: ActionType,
    /// Completion fraction in `[0, 1]`.
    #[validate(range(min = 0.0, max = 1.0, message = "progress must lie in [0, 1]"))]
    pub progress: f64,
    /// Planned duration in milliseconds.
    pub duration_ms: u64,
    /// When the action started.
    pub started_at: DateTime<Utc>,
    /// When the action stopped being current.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the action is finished (completed, cancelled or superseded).
    pub is_completed: bool,
    /// Why the action stopped, once it has.
    #[serde(default)]
    pub end_reason: Option<ActionEndReason>,
    /// Free-form progress counters.
    #[serde(default)]
    pub progress_data: serde_json::Map<String, serde_json::Value>,
}

impl ActionTarget {
    /// Start a new action now.
    pub fn start(
        player_id: PlayerId,
        action_type: ActionType,
        target_type: &str,
        target_id: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: ActionTargetId::generate(),
            player_id,
            target_type: target_type.to_owned(),
            target_id: target_id.to_owned(),
            target_name: String::new(),
            action_type,
            progress: 0.0,
            duration_ms,
            started_at: Utc::now(),
            completed_at: None,
            is_completed: false,
            end_reason: None,
            progress_data: serde_json::Map::new(),
        }
    }

    /// Mark the action finished for `reason` at `at`.
    pub fn finish(&mut self, reason: ActionEndReason, at: DateTime<Utc>) {
        self.is_completed = true;
        self.completed_at = Some(at);
        self.end_reason = Some(reason);
        if reason == ActionEndReason::Completed {
            self.progress = 1.0;
        }
    }

    /// Check record-local invariants.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the record is malformed.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.is_blank() || self.player_id.is_blank() {
            return Err(String::from("action target and player ids must not be empty"));
        }
        if !self.progress.is_finite() {
            return Err(String::from("progress must be a finite number"));
        }
        self.validate().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_outside_unit_interval_is_rejected() {
        let mut target = ActionTarget::start(
            PlayerId::from("char-1"),
            ActionType::Gathering,
            "resource_node",
            "oak-tree",
            30_000,
        );
        assert!(target.check_invariants().is_ok());
        target.progress = 1.5;
        assert!(target.check_invariants().is_err());
        target.progress = f64::NAN;
        assert!(target.check_invariants().is_err());
    }

    #[test]
    fn finishing_completed_sets_full_progress() {
        let mut target = ActionTarget::start(
            PlayerId::from("char-1"),
            ActionType::Crafting,
            "recipe",
            "iron-sword",
            60_000,
        );
        target.finish(ActionEndReason::Completed, Utc::now());
        assert!(target.is_completed);
        assert!(target.completed_at.is_some());
        assert!((target.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn superseding_keeps_progress() {
        let mut target = ActionTarget::start(
            PlayerId::from("char-1"),
            ActionType::Gathering,
            "resource_node",
            "copper",
            10_000,
        );
        target.progress = 0.25;
        target.finish(ActionEndReason::Superseded, Utc::now());
        assert!((target.progress - 0.25).abs() < f64::EPSILON);
        assert_eq!(target.end_reason, Some(ActionEndReason::Superseded));
    }
}
