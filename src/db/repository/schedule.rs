use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::medication::parse_rule;
use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::*;

const ENTRY_COLUMNS: &str =
    "id, medication_id, compartment, rule, starts_at, retired_at, created_at";

type EntryRow = (String, String, u8, Option<String>, String, Option<String>, String);

fn entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
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

fn entry_from_row(row: EntryRow) -> Result<ScheduleEntry, DatabaseError> {
    let (id, medication_id, compartment, rule, starts_at, retired_at, created_at) = row;
    Ok(ScheduleEntry {
        id: parse_uuid(&id)?,
        medication_id: parse_uuid(&medication_id)?,
        compartment,
        rule: rule.as_deref().map(parse_rule).transpose()?,
        starts_at: parse_ts(&starts_at)?,
        retired_at: retired_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

pub fn insert_schedule_entry(conn: &Connection, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
    let rule = entry.rule.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO schedule_entries
         (id, medication_id, compartment, rule, starts_at, retired_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id.to_string(),
            entry.medication_id.to_string(),
            entry.compartment,
            rule,
            format_ts(entry.starts_at),
            entry.retired_at.map(format_ts),
            format_ts(entry.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_schedule_entry(conn: &Connection, id: &Uuid) -> Result<Option<ScheduleEntry>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE id = ?1"),
            params![id.to_string()],
            entry_row,
        )
        .optional()?;
    row.map(entry_from_row).transpose()
}

pub fn list_schedule_entries(
    conn: &Connection,
    include_retired: bool,
) -> Result<Vec<ScheduleEntry>, DatabaseError> {
    let filter = if include_retired { "" } else { "WHERE retired_at IS NULL" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM schedule_entries {filter} ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map([], entry_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(entry_from_row(row?)?);
    }
    Ok(entries)
}

/// Entries targeting `compartment`, retired ones included.
pub fn list_entries_for_compartment(
    conn: &Connection,
    compartment: u8,
) -> Result<Vec<ScheduleEntry>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE compartment = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![compartment], entry_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(entry_from_row(row?)?);
    }
    Ok(entries)
}

/// Stop producing occurrences from `at` on. Retiring twice keeps the first instant.
pub fn retire_schedule_entry(
    conn: &Connection,
    id: &Uuid,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE schedule_entries SET retired_at = ?2 WHERE id = ?1 AND retired_at IS NULL",
        params![id.to_string(), format_ts(at)],
    )?;
    Ok(changed > 0)
}

/// Upper bound (exclusive) up to which occurrences have been written.
pub fn get_materialized_through(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT materialized_through FROM schedule_entries WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    raw.flatten().as_deref().map(parse_ts).transpose()
}

/// Only ever moves the cursor forward.
pub fn advance_materialized_through(
    conn: &Connection,
    id: &Uuid,
    through: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE schedule_entries SET materialized_through = ?2
         WHERE id = ?1 AND (materialized_through IS NULL OR materialized_through < ?2)",
        params![id.to_string(), format_ts(through)],
    )?;
    Ok(())
}

/// Pull the cursor back to `to` when it is ahead of it.
pub fn rewind_materialized_through(
    conn: &Connection,
    id: &Uuid,
    to: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE schedule_entries SET materialized_through = ?2
         WHERE id = ?1 AND materialized_through > ?2",
        params![id.to_string(), format_ts(to)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn entry_round_trip() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let entry = entry(&conn, &med, 1, daily(8, 0));
        assert_eq!(get_schedule_entry(&conn, &entry.id).unwrap().unwrap(), entry);
    }

    #[test]
    fn entry_without_rule_round_trips() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let mut entry = entry(&conn, &med, 1, daily(8, 0));
        entry.id = Uuid::new_v4();
        entry.rule = None;
        insert_schedule_entry(&conn, &entry).unwrap();
        assert!(get_schedule_entry(&conn, &entry.id).unwrap().unwrap().rule.is_none());
    }

    #[test]
    fn retired_entries_hidden_unless_requested() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let keep = entry(&conn, &med, 1, daily(8, 0));
        let gone = entry(&conn, &med, 2, daily(20, 0));

        assert!(retire_schedule_entry(&conn, &gone.id, at(5, 0, 0)).unwrap());
        assert!(!retire_schedule_entry(&conn, &gone.id, at(6, 0, 0)).unwrap());

        let active = list_schedule_entries(&conn, false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);

        let all = list_schedule_entries(&conn, true).unwrap();
        assert_eq!(all.len(), 2);
        let retired = get_schedule_entry(&conn, &gone.id).unwrap().unwrap();
        assert_eq!(retired.retired_at, Some(at(5, 0, 0)));
    }

    #[test]
    fn compartment_listing_filters() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        entry(&conn, &med, 1, daily(8, 0));
        entry(&conn, &med, 2, daily(20, 0));
        assert_eq!(list_entries_for_compartment(&conn, 2).unwrap().len(), 1);
        assert!(list_entries_for_compartment(&conn, 5).unwrap().is_empty());
    }

    #[test]
    fn cursor_only_moves_forward() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let entry = entry(&conn, &med, 1, daily(8, 0));
        assert_eq!(get_materialized_through(&conn, &entry.id).unwrap(), None);

        advance_materialized_through(&conn, &entry.id, at(3, 0, 0)).unwrap();
        advance_materialized_through(&conn, &entry.id, at(2, 0, 0)).unwrap();
        assert_eq!(get_materialized_through(&conn, &entry.id).unwrap(), Some(at(3, 0, 0)));
    }

    #[test]
    fn rewind_only_moves_back() {
        let conn = open_memory_database().unwrap();
        let med = medication(&conn, Uuid::new_v4(), "Aspirin");
        let entry = entry(&conn, &med, 1, daily(8, 0));
        rewind_materialized_through(&conn, &entry.id, at(2, 0, 0)).unwrap();
        assert_eq!(get_materialized_through(&conn, &entry.id).unwrap(), None);

        advance_materialized_through(&conn, &entry.id, at(5, 0, 0)).unwrap();
        rewind_materialized_through(&conn, &entry.id, at(6, 0, 0)).unwrap();
        assert_eq!(get_materialized_through(&conn, &entry.id).unwrap(), Some(at(5, 0, 0)));
        rewind_materialized_through(&conn, &entry.id, at(3, 0, 0)).unwrap();
        assert_eq!(get_materialized_through(&conn, &entry.id).unwrap(), Some(at(3, 0, 0)));
    }
}
