use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::enums::Outcome;
use crate::models::*;

const HISTORY_COLUMNS: &str =
    "id, user_id, occurrence_id, recorded_at, outcome, medications, created_at";

type HistoryRow = (String, String, Option<String>, String, String, String, String);

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn history_from_row(row: HistoryRow) -> Result<HistoryRecord, DatabaseError> {
    let (id, user_id, occurrence_id, recorded_at, outcome, medications, created_at) = row;
    Ok(HistoryRecord {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        occurrence_id: occurrence_id.as_deref().map(parse_uuid).transpose()?,
        recorded_at: parse_ts(&recorded_at)?,
        outcome: Outcome::from_str(&outcome)?,
        medications: serde_json::from_str(&medications)?,
        created_at: parse_ts(&created_at)?,
    })
}

/// Append a record. History is never updated or deleted afterwards.
pub fn insert_history(conn: &Connection, record: &HistoryRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO history (id, user_id, occurrence_id, recorded_at, outcome, medications, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id.to_string(),
            record.user_id.to_string(),
            record.occurrence_id.map(|id| id.to_string()),
            format_ts(record.recorded_at),
            record.outcome.as_str(),
            serde_json::to_string(&record.medications)?,
            format_ts(record.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_history(conn: &Connection, id: &Uuid) -> Result<Option<HistoryRecord>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {HISTORY_COLUMNS} FROM history WHERE id = ?1"),
            params![id.to_string()],
            history_row,
        )
        .optional()?;
    row.map(history_from_row).transpose()
}

pub fn get_history_for_occurrence(
    conn: &Connection,
    occurrence_id: &Uuid,
) -> Result<Option<HistoryRecord>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {HISTORY_COLUMNS} FROM history WHERE occurrence_id = ?1"),
            params![occurrence_id.to_string()],
            history_row,
        )
        .optional()?;
    row.map(history_from_row).transpose()
}

/// Records with `from <= recorded_at < to` (either bound optional),
/// oldest first.
pub fn list_history(
    conn: &Connection,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Vec<HistoryRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HISTORY_COLUMNS} FROM history
         WHERE (?1 IS NULL OR recorded_at >= ?1) AND (?2 IS NULL OR recorded_at < ?2)
         ORDER BY recorded_at, created_at, id"
    ))?;
    let rows = stmt.query_map(params![from.map(format_ts), to.map(format_ts)], history_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(history_from_row(row?)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::sqlite::open_memory_database;

    fn record(occurrence_id: Option<Uuid>, outcome: Outcome, recorded_at: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            occurrence_id,
            recorded_at,
            outcome,
            medications: vec![MedicationRef { id: Uuid::new_v4(), name: Some("Aspirin".into()) }],
            created_at: recorded_at,
        }
    }

    #[test]
    fn record_round_trip() {
        let conn = open_memory_database().unwrap();
        let rec = record(None, Outcome::Taken, at(2, 9, 30));
        insert_history(&conn, &rec).unwrap();
        assert_eq!(get_history(&conn, &rec.id).unwrap().unwrap(), rec);
    }

    #[test]
    fn one_record_per_occurrence() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let entry = entry(&conn, &med, 1, daily(8, 0));
        let occ = occurrence(&conn, &entry, at(2, 8, 0));

        let first = record(Some(occ.id), Outcome::Taken, at(2, 8, 10));
        insert_history(&conn, &first).unwrap();
        assert!(insert_history(&conn, &record(Some(occ.id), Outcome::Missed, at(2, 8, 30))).is_err());
        assert_eq!(get_history_for_occurrence(&conn, &occ.id).unwrap().unwrap().id, first.id);

        // Spontaneous records are unconstrained.
        insert_history(&conn, &record(None, Outcome::Taken, at(2, 9, 0))).unwrap();
        insert_history(&conn, &record(None, Outcome::Taken, at(2, 9, 0))).unwrap();
    }

    #[test]
    fn history_is_immutable() {
        let conn = open_memory_database().unwrap();
        let rec = record(None, Outcome::Taken, at(2, 9, 30));
        insert_history(&conn, &rec).unwrap();
        assert!(conn
            .execute("UPDATE history SET outcome = 'skipped' WHERE id = ?1", params![rec.id.to_string()])
            .is_err());
        assert!(conn
            .execute("DELETE FROM history WHERE id = ?1", params![rec.id.to_string()])
            .is_err());
    }

    #[test]
    fn list_respects_optional_bounds() {
        let conn = open_memory_database().unwrap();
        for day in 2..=4 {
            insert_history(&conn, &record(None, Outcome::Taken, at(day, 8, 0))).unwrap();
        }
        assert_eq!(list_history(&conn, None, None).unwrap().len(), 3);
        assert_eq!(list_history(&conn, Some(at(3, 0, 0)), None).unwrap().len(), 2);
        assert_eq!(list_history(&conn, None, Some(at(3, 8, 0))).unwrap().len(), 1);
        let mid = list_history(&conn, Some(at(3, 0, 0)), Some(at(4, 0, 0))).unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].recorded_at, at(3, 8, 0));
    }
}
