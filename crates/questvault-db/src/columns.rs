//! Conversion between structured fields and flat relational columns.
//!
//! Relational backends store every variable-shape field (inventory,
//! professions, quest counters, opaque battle blobs, ...) as a JSON text
//! column. Encoding failures are real errors: nothing is written.
//! Decoding failures mean stored data is damaged; they never fail the
//! whole entity load. The field degrades to its `Default` and a
//! data-integrity warning is logged with the entity, key and field.
//!
//! Timestamps are stored as integer Unix milliseconds so range filters
//! compare numerically regardless of engine text formatting.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreResult;

/// Encode a nested value as a JSON text column.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`](crate::StoreError::Serialization)
/// when the value cannot be represented as JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text column, falling back to `T::default()` on damage.
///
/// `NULL` and empty columns decode silently to the default; malformed
/// text decodes to the default and logs a warning.
pub fn decode_or_default<T>(raw: Option<&str>, entity: &'static str, key: &str, field: &'static str) -> T
where
    T: DeserializeOwned + Default,
{
    let Some(text) = raw.filter(|t| !t.trim().is_empty()) else {
        return T::default();
    };
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                entity,
                key,
                field,
                error = %e,
                "stored column could not be decoded, using default"
            );
            T::default()
        }
    }
}

/// Decode an optional nested value; damage degrades to `None`.
pub fn decode_optional<T>(raw: Option<&str>, entity: &'static str, key: &str, field: &'static str) -> Option<T>
where
    T: DeserializeOwned,
{
    let text = raw.filter(|t| !t.trim().is_empty() && *t != "null")?;
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                entity,
                key,
                field,
                error = %e,
                "stored column could not be decoded, dropping optional field"
            );
            None
        }
    }
}

/// Parse a stable-text enum column, falling back on unknown spellings.
pub fn parse_text<T: Copy>(
    raw: &str,
    parse: fn(&str) -> Option<T>,
    fallback: T,
    entity: &'static str,
    key: &str,
    field: &'static str,
) -> T {
    parse(raw).unwrap_or_else(|| {
        tracing::warn!(entity, key, field, value = raw, "unknown enum spelling in stored column, using fallback");
        fallback
    })
}

/// Timestamp to column value.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Optional timestamp to column value.
pub fn to_millis_opt(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

/// Column value to timestamp; out-of-range values clamp to the epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Optional column value to timestamp.
pub fn from_millis_opt(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}

/// Unsigned counter to a signed integer column, saturating.
pub fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Signed integer column to an unsigned counter; negatives clamp to zero.
pub fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Signed integer column to a `u32` field, clamping into range.
pub fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use questvault_types::{InventoryItem, Professions};

    use super::*;

    #[test]
    fn damaged_blob_degrades_to_default() {
        let decoded: Vec<InventoryItem> =
            decode_or_default(Some("{not json"), "player", "char-1", "inventory");
        assert!(decoded.is_empty());
    }

    #[test]
    fn null_and_empty_columns_are_defaults() {
        let a: BTreeMap<String, i64> = decode_or_default(None, "player", "p", "reputation");
        let b: BTreeMap<String, i64> = decode_or_default(Some("  "), "player", "p", "reputation");
        assert!(a.is_empty() && b.is_empty());
    }

    #[test]
    fn valid_blob_decodes() {
        let mut profs = Professions::default();
        profs.gathering.insert(String::from("mining"), questvault_types::ProfessionProgress {
            level: 4,
            experience: 120,
        });
        let text = encode(&profs).unwrap_or_default();
        let back: Professions = decode_or_default(Some(&text), "player", "p", "professions");
        assert_eq!(back, profs);
    }

    #[test]
    fn optional_blob_damage_is_none() {
        let v: Option<questvault_types::OfflineSession> =
            decode_optional(Some("[1,2"), "player", "p", "last_offline_session");
        assert!(v.is_none());
        let n: Option<questvault_types::OfflineSession> =
            decode_optional(Some("null"), "player", "p", "last_offline_session");
        assert!(n.is_none());
    }

    #[test]
    fn unknown_enum_text_uses_fallback() {
        use questvault_types::TeamStatus;
        let status = parse_text("IN_BATTLE", TeamStatus::parse, TeamStatus::Active, "team", "t", "status");
        assert_eq!(status, TeamStatus::InBattle);
        let odd = parse_text("sleeping", TeamStatus::parse, TeamStatus::Active, "team", "t", "status");
        assert_eq!(odd, TeamStatus::Active);
    }

    #[test]
    fn millis_roundtrip_and_clamping() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
        assert_eq!(to_u64(-5), 0);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u32(-1), 0);
    }
}
