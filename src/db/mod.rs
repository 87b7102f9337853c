pub mod retry;
pub mod sqlite;
pub mod repository;

pub use sqlite::*;
pub use repository::*;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored recurrence rule is unreadable: {0}")]
    InvalidRule(String),
}

/// Timestamps are stored as fixed-width UTC text so that lexical order in
/// SQL equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Truncate to whole seconds, the precision of the ledger.
pub fn normalize_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp {raw:?}: {e}")))
}

pub fn parse_uuid(raw: &str) -> Result<uuid::Uuid, DatabaseError> {
    uuid::Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_text_round_trips_at_second_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 5).unwrap();
        let text = format_ts(ts);
        assert_eq!(text, "2024-03-10T08:00:05Z");
        assert_eq!(parse_ts(&text).unwrap(), ts);
    }

    #[test]
    fn normalize_drops_subseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 5).unwrap()
            + chrono::Duration::milliseconds(750);
        assert_eq!(format_ts(normalize_ts(ts)), "2024-03-10T08:00:05Z");
    }

    #[test]
    fn text_order_is_chronological() {
        let a = format_ts(Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 59).unwrap());
        let b = format_ts(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        assert!(a < b);
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        assert!(parse_ts("2024-03-10 08:00:00").is_err());
    }
}
