use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::*;

pub fn insert_pillbox(conn: &Connection, pillbox: &Pillbox) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO pillboxes (id, owner_id, compartment_count, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            pillbox.id.to_string(),
            pillbox.owner_id.to_string(),
            pillbox.compartment_count(),
            format_ts(pillbox.created_at),
        ],
    )?;
    for compartment in pillbox.compartments() {
        conn.execute(
            "INSERT INTO compartments (pillbox_id, idx, medication_id) VALUES (?1, ?2, ?3)",
            params![
                pillbox.id.to_string(),
                compartment.index,
                compartment.medication_id.map(|id| id.to_string()),
            ],
        )?;
    }
    Ok(())
}

/// The pillbox owned by `owner_id`, with its compartment bindings.
pub fn get_pillbox(conn: &Connection, owner_id: &Uuid) -> Result<Option<Pillbox>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, created_at FROM pillboxes WHERE owner_id = ?1",
            params![owner_id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let Some((id, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT idx, medication_id FROM compartments WHERE pillbox_id = ?1 ORDER BY idx",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, u8>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut compartments = Vec::new();
    for row in rows {
        let (index, medication_id) = row?;
        compartments.push(Compartment {
            index,
            medication_id: medication_id.as_deref().map(parse_uuid).transpose()?,
        });
    }

    Pillbox::from_parts(parse_uuid(&id)?, *owner_id, compartments, parse_ts(&created_at)?)
        .map(Some)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

/// Bind (or clear, with `None`) one compartment.
pub fn set_compartment(
    conn: &Connection,
    pillbox_id: &Uuid,
    index: u8,
    medication_id: Option<&Uuid>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE compartments SET medication_id = ?3 WHERE pillbox_id = ?1 AND idx = ?2",
        params![
            pillbox_id.to_string(),
            index,
            medication_id.map(|id| id.to_string()),
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "compartment".into(),
            id: format!("{pillbox_id}#{index}"),
        });
    }
    Ok(())
}
