use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::*;

const MEDICATION_COLUMNS: &str =
    "id, owner_id, name, default_rule, starts_on, ends_on, created_at";

type MedicationRow = (String, String, String, Option<String>, Option<String>, Option<String>, String);

fn medication_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MedicationRow> {
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

fn medication_from_row(row: MedicationRow) -> Result<Medication, DatabaseError> {
    let (id, owner_id, name, default_rule, starts_on, ends_on, created_at) = row;
    Ok(Medication {
        id: parse_uuid(&id)?,
        owner_id: parse_uuid(&owner_id)?,
        name,
        default_rule: default_rule.as_deref().map(parse_rule).transpose()?,
        validity: ValidityWindow {
            starts_on: starts_on.as_deref().map(parse_date).transpose()?,
            ends_on: ends_on.as_deref().map(parse_date).transpose()?,
        },
        created_at: parse_ts(&created_at)?,
    })
}

/// Parse a stored recurrence rule; unreadable rules keep their own error kind.
pub(crate) fn parse_rule(raw: &str) -> Result<RecurrenceRule, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::InvalidRule(e.to_string()))
}

fn parse_date(raw: &str) -> Result<chrono::NaiveDate, DatabaseError> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date {raw:?}: {e}")))
}

pub fn insert_medication(conn: &Connection, med: &Medication) -> Result<(), DatabaseError> {
    let rule = med.default_rule.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO medications (id, owner_id, name, default_rule, starts_on, ends_on, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            med.id.to_string(),
            med.owner_id.to_string(),
            med.name,
            rule,
            med.validity.starts_on.map(|d| d.to_string()),
            med.validity.ends_on.map(|d| d.to_string()),
            format_ts(med.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_medication(conn: &Connection, id: &Uuid) -> Result<Option<Medication>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {MEDICATION_COLUMNS} FROM medications WHERE id = ?1"),
            params![id.to_string()],
            medication_row,
        )
        .optional()?;
    row.map(medication_from_row).transpose()
}

pub fn list_medications(conn: &Connection) -> Result<Vec<Medication>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEDICATION_COLUMNS} FROM medications ORDER BY name, id"
    ))?;
    let rows = stmt.query_map([], medication_row)?;

    let mut meds = Vec::new();
    for row in rows {
        meds.push(medication_from_row(row?)?);
    }
    Ok(meds)
}

/// Rename in place. History keeps the name it was written with.
pub fn rename_medication(conn: &Connection, id: &Uuid, name: &str) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE medications SET name = ?2 WHERE id = ?1",
        params![id.to_string(), name],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "medication".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Snapshot references for a history record. Unknown ids are kept with no name.
pub fn medication_refs(conn: &Connection, ids: &[Uuid]) -> Result<Vec<MedicationRef>, DatabaseError> {
    let mut names: HashMap<Uuid, String> = HashMap::new();
    let mut stmt = conn.prepare("SELECT name FROM medications WHERE id = ?1")?;
    for id in ids {
        if let Some(name) = stmt
            .query_row(params![id.to_string()], |row| row.get::<_, String>(0))
            .optional()?
        {
            names.insert(*id, name);
        }
    }

    let mut seen = std::collections::HashSet::new();
    Ok(ids
        .iter()
        .filter(|id| seen.insert(**id))
        .map(|id| MedicationRef {
            id: *id,
            name: names.get(id).cloned(),
        })
        .collect())
}
