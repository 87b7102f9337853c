//! Engine error taxonomy.
//!
//! Every engine operation returns `Result<_, EngineError>`. The variants map
//! one-to-one onto how a caller is expected to react:
//! - `InvalidRecurrenceRule`, `CompartmentConflict`, `Validation`: fix the input.
//! - `Unbound`: data-integrity gap, log and carry on.
//! - `AlreadyRecorded`: the dose is already tracked, treat as success.
//! - `PersistenceUnavailable`: retry budget exhausted, surface upwards.

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid recurrence rule: {0}")]
    InvalidRecurrenceRule(String),

    #[error("Compartment {compartment} is already claimed by medication {held_by}")]
    CompartmentConflict { compartment: u8, held_by: Uuid },

    #[error("Schedule entry {0} has no compartment bound to its medication")]
    Unbound(Uuid),

    #[error("Occurrence {occurrence_id} already recorded by history record {history_id}")]
    AlreadyRecorded { occurrence_id: Uuid, history_id: Uuid },

    #[error("No occurrence of schedule entry {schedule_entry_id} is due at {due_at}")]
    UnknownOccurrence {
        schedule_entry_id: Uuid,
        due_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Not found: {entity_type} with id {id}")]
    NotFound { entity_type: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Persistence unavailable after {attempts} attempts: {last_error}")]
    PersistenceUnavailable { attempts: u32, last_error: String },

    #[error("Database error: {0}")]
    Database(#[source] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DatabaseError> for EngineError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::InvalidRule(msg) => EngineError::InvalidRecurrenceRule(msg),
            other => EngineError::Database(other),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(DatabaseError::Sqlite(e))
    }
}

impl EngineError {
    /// Busy/locked database: worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Database(DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }

    /// `AlreadyRecorded` is a no-op success from the caller's point of view.
    pub fn is_already_tracked(&self) -> bool {
        matches!(self, EngineError::AlreadyRecorded { .. })
    }

    pub(crate) fn not_found(entity_type: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> EngineError {
        EngineError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_transient());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_transient());
    }

    #[test]
    fn constraint_failure_is_not_transient() {
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_transient());
        assert!(!EngineError::Validation("x".into()).is_transient());
    }

    #[test]
    fn already_recorded_is_tracked() {
        let err = EngineError::AlreadyRecorded {
            occurrence_id: Uuid::nil(),
            history_id: Uuid::nil(),
        };
        assert!(err.is_already_tracked());
        assert!(!EngineError::Cancelled.is_already_tracked());
    }

    #[test]
    fn stored_rule_corruption_surfaces_as_invalid_rule() {
        let err = EngineError::from(DatabaseError::InvalidRule("bad json".into()));
        assert!(matches!(err, EngineError::InvalidRecurrenceRule(_)));
    }

    #[test]
    fn conflict_message_names_compartment() {
        let err = EngineError::CompartmentConflict {
            compartment: 3,
            held_by: Uuid::nil(),
        };
        assert!(err.to_string().contains("Compartment 3"));
    }
}
