//! Player characters and their nested, variable-shape state.
//!
//! Everything below [`Player`] that has no fixed shape (inventory,
//! professions, quest counters, ...) is persisted by relational
//! backends as a structured-text blob column, so every nested type
//! here derives `Default` and uses `#[serde(default)]` liberally: a
//! damaged blob degrades to an empty value instead of failing the
//! whole record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ids::{PlayerId, UserId};

/// Base attributes of a character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attributes {
    /// Physical power.
    pub strength: i64,
    /// Speed and precision.
    pub agility: i64,
    /// Magical aptitude.
    pub intelligence: i64,
    /// Toughness.
    pub vitality: i64,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            strength: 10,
            agility: 10,
            intelligence: 10,
            vitality: 10,
        }
    }
}

/// Level and progress in a single profession.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfessionProgress {
    /// Current profession level.
    pub level: u32,
    /// Experience towards the next level.
    pub experience: u64,
}

/// Per-profession progress grouped by profession family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Professions {
    /// Combat professions (warrior, mage, ...).
    pub battle: BTreeMap<String, ProfessionProgress>,
    /// Gathering professions (mining, herbalism, ...).
    pub gathering: BTreeMap<String, ProfessionProgress>,
    /// Production professions (smithing, alchemy, ...).
    pub production: BTreeMap<String, ProfessionProgress>,
}

/// One stack in the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Item template key.
    pub item_id: String,
    /// Stack size.
    pub quantity: u32,
    /// Bag slot, if placed.
    #[serde(default)]
    pub slot: Option<u32>,
    /// Instance-specific data (rolls, durability, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A consumable placed in a quick-use loadout slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumableSlot {
    /// Loadout slot index.
    pub slot: u32,
    /// Item template key.
    pub item_id: String,
    /// Quantity reserved for the loadout.
    pub quantity: u32,
    /// Auto-use when the resource fraction falls below this value.
    #[serde(default)]
    pub use_threshold: f64,
}

/// Learned and equipped skills.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillSet {
    /// Skill key to learned rank.
    pub learned: BTreeMap<String, u32>,
    /// Skill keys on the action bar, in order.
    pub equipped: Vec<String>,
}

/// Quest progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestProgress {
    /// Quests in progress.
    pub active: Vec<String>,
    /// Quests turned in.
    pub completed: Vec<String>,
    /// Quest key to objective key to counter.
    pub objectives: BTreeMap<String, BTreeMap<String, u32>>,
}

/// A parallel activity slot (idle gathering queues and similar).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySlot {
    /// Slot position.
    pub slot_index: u32,
    /// Activity kind occupying the slot.
    pub activity_type: String,
    /// Target of the activity.
    #[serde(default)]
    pub target_id: Option<String>,
    /// When the activity started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Summary of the last offline-progress session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSession {
    /// When the player went offline.
    pub started_at: DateTime<Utc>,
    /// When offline progress was settled.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Rewards and events accrued while offline.
    #[serde(default)]
    pub summary: serde_json::Value,
}

/// A player character.
///
/// Writes always replace the whole record for its key. Experience and
/// level never decrease except through an explicit progress reset, and
/// `is_dead` implies `died_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Player {
    /// Primary key.
    pub id: PlayerId,
    /// Owning account, if linked.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Character name.
    #[validate(length(min = 1, max = 64, message = "player name must be 1-64 characters"))]
    pub name: String,
    /// Main profession shown in listings.
    #[serde(default)]
    pub profession: String,
    /// Character level.
    pub level: u32,
    /// Experience within the current level.
    pub experience: u64,
    /// Current health.
    pub health: i64,
    /// Maximum health.
    pub max_health: i64,
    /// Current mana.
    pub mana: i64,
    /// Maximum mana.
    pub max_mana: i64,
    /// Gold carried.
    pub gold: u64,
    /// Base attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Profession levels grouped by family.
    #[serde(default)]
    pub professions: Professions,
    /// Faction key to standing.
    #[serde(default)]
    pub reputation: BTreeMap<String, i64>,
    /// Bag contents.
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
    /// Equipment slot to item key.
    #[serde(default)]
    pub equipment: BTreeMap<String, String>,
    /// Consumable loadout.
    #[serde(default)]
    pub consumables: Vec<ConsumableSlot>,
    /// Skills.
    #[serde(default)]
    pub skills: SkillSet,
    /// Quests.
    #[serde(default)]
    pub quests: QuestProgress,
    /// Parallel activity slots.
    #[serde(default)]
    pub activity_slots: Vec<ActivitySlot>,
    /// Last offline session snapshot.
    #[serde(default)]
    pub last_offline_session: Option<OfflineSession>,
    /// Whether the player is connected.
    #[serde(default)]
    pub is_online: bool,
    /// Last time the player was seen online.
    #[serde(default)]
    pub last_online_at: Option<DateTime<Utc>>,
    /// Whether the character is dead.
    #[serde(default)]
    pub is_dead: bool,
    /// Time of death; required when `is_dead`.
    #[serde(default)]
    pub died_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Player {
    /// A fresh level-1 character.
    pub fn new(id: PlayerId, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: None,
            name: name.to_owned(),
            profession: String::new(),
            level: 1,
            experience: 0,
            health: 100,
            max_health: 100,
            mana: 50,
            max_mana: 50,
            gold: 0,
            attributes: Attributes::default(),
            professions: Professions::default(),
            reputation: BTreeMap::new(),
            inventory: Vec::new(),
            equipment: BTreeMap::new(),
            consumables: Vec::new(),
            skills: SkillSet::default(),
            quests: QuestProgress::default(),
            activity_slots: Vec::new(),
            last_offline_session: None,
            is_online: false,
            last_online_at: None,
            is_dead: false,
            died_at: None,
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
        if self.id.is_blank() {
            return Err(String::from("player id must not be empty"));
        }
        self.validate().map_err(|e| e.to_string())?;
        if self.level == 0 {
            return Err(String::from("player level starts at 1"));
        }
        if self.is_dead && self.died_at.is_none() {
            return Err(String::from("a dead player must carry a death timestamp"));
        }
        if self.health > self.max_health || self.mana > self.max_mana {
            return Err(String::from("resource pools exceed their maximum"));
        }
        Ok(())
    }

    /// Check that `self` does not lower progression relative to `previous`.
    ///
    /// # Errors
    ///
    /// Returns a reason when level, or experience at the same level,
    /// would go backwards.
    pub fn check_progression(&self, previous: &Self) -> Result<(), String> {
        if self.level < previous.level {
            return Err(format!(
                "level cannot decrease from {} to {} without a reset",
                previous.level, self.level
            ));
        }
        if self.level == previous.level && self.experience < previous.experience {
            return Err(format!(
                "experience cannot decrease from {} to {} at level {}",
                previous.experience, self.experience, self.level
            ));
        }
        Ok(())
    }

    /// Reset level and experience to a fresh character's values.
    pub fn reset_progress(&mut self) {
        self.level = 1;
        self.experience = 0;
        self.updated_at = Utc::now();
    }
}
