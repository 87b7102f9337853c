use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::enums::OccurrenceStatus;
use crate::models::*;

const OCCURRENCE_COLUMNS: &str =
    "id, schedule_entry_id, medication_id, due_at, compartment, state, history_id, resolved_at";

type OccurrenceRow = (
    String,
    String,
    String,
    String,
    Option<u8>,
    String,
    Option<String>,
    Option<String>,
);

fn occurrence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OccurrenceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn occurrence_from_row(row: OccurrenceRow) -> Result<LedgerOccurrence, DatabaseError> {
    let (id, entry_id, medication_id, due_at, compartment, state, history_id, resolved_at) = row;
    let occurrence = Occurrence {
        id: parse_uuid(&id)?,
        schedule_entry_id: parse_uuid(&entry_id)?,
        medication_id: parse_uuid(&medication_id)?,
        due_at: parse_ts(&due_at)?,
        compartment,
    };

    let resolution = match (history_id, resolved_at) {
        (Some(h), Some(r)) => Some((parse_uuid(&h)?, parse_ts(&r)?)),
        _ => None,
    };
    let state = match (OccurrenceStatus::from_str(&state)?, resolution) {
        (OccurrenceStatus::Pending, _) => OccurrenceState::Pending,
        (OccurrenceStatus::Matched, Some((history_id, resolved_at))) => {
            OccurrenceState::Matched { history_id, resolved_at }
        }
        (OccurrenceStatus::Missed, Some((history_id, resolved_at))) => {
            OccurrenceState::Missed { history_id, resolved_at }
        }
        (status, None) => {
            return Err(DatabaseError::ConstraintViolation(format!(
                "occurrence {id} is {status} without a history record"
            )))
        }
    };
    Ok(LedgerOccurrence { occurrence, state })
}

fn collect(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<LedgerOccurrence>, DatabaseError> {
    let rows = stmt.query_map(params, occurrence_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(occurrence_from_row(row?)?);
    }
    Ok(out)
}

/// Insert a pending occurrence unless its key already exists.
/// Returns whether a row was written.
pub fn insert_occurrence_if_absent(conn: &Connection, occ: &Occurrence) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO occurrences
         (id, schedule_entry_id, medication_id, due_at, compartment, state)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
        params![
            occ.id.to_string(),
            occ.schedule_entry_id.to_string(),
            occ.medication_id.to_string(),
            format_ts(occ.due_at),
            occ.compartment,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn get_occurrence(conn: &Connection, id: &Uuid) -> Result<Option<LedgerOccurrence>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {OCCURRENCE_COLUMNS} FROM occurrences WHERE id = ?1"),
            params![id.to_string()],
            occurrence_row,
        )
        .optional()?;
    row.map(occurrence_from_row).transpose()
}

/// Occurrences with `from <= due_at < to`, ordered by due time then entry.
pub fn list_occurrences_due_between(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<LedgerOccurrence>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
         WHERE due_at >= ?1 AND due_at < ?2
         ORDER BY due_at, schedule_entry_id"
    ))?;
    collect(&mut stmt, params![format_ts(from), format_ts(to)])
}

/// Occurrences of `medication_id` with `from <= due_at <= to`, any state.
pub fn list_medication_occurrences_in_window(
    conn: &Connection,
    medication_id: &Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<LedgerOccurrence>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
         WHERE medication_id = ?1 AND due_at >= ?2 AND due_at <= ?3
         ORDER BY due_at, schedule_entry_id"
    ))?;
    collect(
        &mut stmt,
        params![medication_id.to_string(), format_ts(from), format_ts(to)],
    )
}

/// Pending occurrences due strictly before `cutoff`, oldest first.
pub fn list_pending_due_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<LedgerOccurrence>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
         WHERE state = 'pending' AND due_at < ?1
         ORDER BY due_at, schedule_entry_id"
    ))?;
    collect(&mut stmt, params![format_ts(cutoff)])
}

/// Pending occurrences due at or before `now` whose `DoseDue` has not gone out.
pub fn list_unannounced_due(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<LedgerOccurrence>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
         WHERE state = 'pending' AND due_announced = 0 AND due_at <= ?1
         ORDER BY due_at, schedule_entry_id"
    ))?;
    collect(&mut stmt, params![format_ts(now)])
}

/// Returns false when another writer announced it first.
pub fn mark_due_announced(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE occurrences SET due_announced = 1 WHERE id = ?1 AND due_announced = 0",
        params![id.to_string()],
    )?;
    Ok(changed > 0)
}

fn resolve_if_pending(
    conn: &Connection,
    id: &Uuid,
    status: OccurrenceStatus,
    history_id: &Uuid,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE occurrences SET state = ?2, history_id = ?3, resolved_at = ?4
         WHERE id = ?1 AND state = 'pending'",
        params![id.to_string(), status.as_str(), history_id.to_string(), format_ts(at)],
    )?;
    Ok(changed > 0)
}

/// Compare-and-set `pending -> matched`. False means the occurrence was
/// already resolved (or does not exist).
pub fn mark_matched_if_pending(
    conn: &Connection,
    id: &Uuid,
    history_id: &Uuid,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    resolve_if_pending(conn, id, OccurrenceStatus::Matched, history_id, at)
}

/// Compare-and-set `pending -> missed`.
pub fn mark_missed_if_pending(
    conn: &Connection,
    id: &Uuid,
    history_id: &Uuid,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    resolve_if_pending(conn, id, OccurrenceStatus::Missed, history_id, at)
}

/// Drop still-pending occurrences of an entry due at or after `from`.
/// Resolved occurrences are kept; they are referenced by history.
pub fn delete_pending_from(
    conn: &Connection,
    schedule_entry_id: &Uuid,
    from: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM occurrences
         WHERE schedule_entry_id = ?1 AND state = 'pending' AND due_at >= ?2",
        params![schedule_entry_id.to_string(), format_ts(from)],
    )?;
    Ok(deleted)
}
