use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::{format_ts, parse_ts, parse_uuid, DatabaseError};
use crate::models::enums::EventKind;
use crate::models::*;

/// Write an event once. A second write of the same id, or a second
/// notification for the same (caregiver, occurrence), is ignored.
pub fn insert_event_if_absent(conn: &Connection, event: &EngineEvent) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO events
         (id, user_id, kind, occurrence_id, history_id, caregiver_id, emitted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.id.to_string(),
            event.user_id.to_string(),
            event.kind.as_str(),
            event.occurrence_id.map(|id| id.to_string()),
            event.history_id.map(|id| id.to_string()),
            event.caregiver_id.map(|id| id.to_string()),
            format_ts(event.emitted_at),
        ],
    )?;
    Ok(inserted > 0)
}

/// Events in write order, optionally only those emitted at or after `since`.
pub fn list_events(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<EngineEvent>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, occurrence_id, history_id, caregiver_id, emitted_at
         FROM events WHERE (?1 IS NULL OR emitted_at >= ?1) ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![since.map(format_ts)], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (id, user_id, kind, occurrence_id, history_id, caregiver_id, emitted_at) = row?;
        events.push(EngineEvent {
            id: parse_uuid(&id)?,
            kind: EventKind::from_str(&kind)?,
            user_id: parse_uuid(&user_id)?,
            occurrence_id: occurrence_id.as_deref().map(parse_uuid).transpose()?,
            history_id: history_id.as_deref().map(parse_uuid).transpose()?,
            caregiver_id: caregiver_id.as_deref().map(parse_uuid).transpose()?,
            emitted_at: parse_ts(&emitted_at)?,
        });
    }
    Ok(events)
}
