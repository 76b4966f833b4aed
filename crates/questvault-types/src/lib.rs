//! Shared type definitions for the Questvault persistence layer.
//!
//! This crate is the single source of truth for the durable entities of
//! the game (accounts, characters, teams, action targets, battles,
//! offline-progress deltas) and for the wire shapes the transport layer
//! and monitoring see. Wire types flow downstream to `TypeScript` via
//! `ts-rs`.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe wrappers for opaque entity keys
//! - [`enums`] -- Status, role and classification enums
//! - [`user`] -- Accounts and account/character links
//! - [`player`] -- Characters and their nested state
//! - [`team`] -- Parties
//! - [`action`] -- Timed action targets
//! - [`battle`] -- Battle records
//! - [`offline`] -- Offline-progress deltas
//! - [`dto`] -- Wire projections, result envelope, stats and health shapes

pub mod action;
pub mod battle;
pub mod dto;
pub mod enums;
pub mod ids;
pub mod offline;
pub mod player;
pub mod team;
pub mod user;

// Re-export all public types at crate root for convenience.
pub use action::ActionTarget;
pub use battle::BattleRecord;
pub use dto::{
    ApiResponse, BatchResult, BattleQuery, CacheStats, CharacterListing, ClassWriteStats,
    HealthReport, MaintenanceStatus, PlayerSummary, StorageStats, UserDto,
};
pub use enums::{
    ActionEndReason, ActionType, BattleStatus, BattleType, EntityKind, ErrorCode, TeamStatus,
    UserRole,
};
pub use ids::{ActionTargetId, BattleId, OfflineDataId, PlayerId, TeamId, UserId};
pub use offline::OfflineData;
pub use player::{
    ActivitySlot, Attributes, ConsumableSlot, InventoryItem, OfflineSession, Player,
    ProfessionProgress, Professions, QuestProgress, SkillSet,
};
pub use team::{MAX_TEAM_SIZE, Team};
pub use user::{LoginRecord, NewUser, User, UserCharacterLink, normalize_key};

#[cfg(test)]
mod tests {
    //! Export checks for `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs writes the files when `export_all` runs; the output lands
        // in `bindings/` relative to the crate root.
        use ts_rs::TS;

        // IDs
        let _ = crate::ids::UserId::export_all();
        let _ = crate::ids::PlayerId::export_all();
        let _ = crate::ids::TeamId::export_all();
        let _ = crate::ids::ActionTargetId::export_all();
        let _ = crate::ids::BattleId::export_all();
        let _ = crate::ids::OfflineDataId::export_all();

        // Enums
        let _ = crate::enums::UserRole::export_all();
        let _ = crate::enums::TeamStatus::export_all();
        let _ = crate::enums::BattleStatus::export_all();
        let _ = crate::enums::BattleType::export_all();
        let _ = crate::enums::ActionType::export_all();
        let _ = crate::enums::ActionEndReason::export_all();
        let _ = crate::enums::EntityKind::export_all();
        let _ = crate::enums::ErrorCode::export_all();

        // Wire shapes
        let _ = crate::dto::UserDto::export_all();
        let _ = crate::dto::CharacterListing::export_all();
        let _ = crate::dto::PlayerSummary::export_all();
        let _ = crate::dto::BatchResult::export_all();
        let _ = crate::dto::BattleQuery::export_all();
        let _ = crate::dto::StorageStats::export_all();
        let _ = crate::dto::ClassWriteStats::export_all();
        let _ = crate::dto::CacheStats::export_all();
        let _ = crate::dto::MaintenanceStatus::export_all();
        let _ = crate::dto::HealthReport::export_all();
        let _ = crate::dto::ApiResponse::<crate::dto::UserDto>::export_all();
    }
}
