use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::{parse_uuid, DatabaseError};
use crate::models::*;

/// Create or replace a subscription. Owned by account management; the
/// engine calls this only to mirror relationships into a partition.
pub fn upsert_cares_for(conn: &Connection, link: &CaresFor) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO cares_for (caregiver_id, cared_for_id, all_notifications, missed_dose_alert, active)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(caregiver_id, cared_for_id) DO UPDATE SET
            all_notifications = excluded.all_notifications,
            missed_dose_alert = excluded.missed_dose_alert,
            active = excluded.active",
        params![
            link.caregiver_id.to_string(),
            link.cared_for_id.to_string(),
            link.preferences.all_notifications,
            link.preferences.missed_dose_alert,
            link.active,
        ],
    )?;
    Ok(())
}

fn query_links(
    conn: &Connection,
    cared_for_id: &Uuid,
    active_only: bool,
) -> Result<Vec<CaresFor>, DatabaseError> {
    let filter = if active_only { "AND active = 1" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT caregiver_id, all_notifications, missed_dose_alert, active
         FROM cares_for WHERE cared_for_id = ?1 {filter} ORDER BY caregiver_id"
    ))?;
    let rows = stmt.query_map(params![cared_for_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, bool>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, bool>(3)?,
        ))
    })?;

    let mut links = Vec::new();
    for row in rows {
        let (caregiver_id, all_notifications, missed_dose_alert, active) = row?;
        links.push(CaresFor {
            caregiver_id: parse_uuid(&caregiver_id)?,
            cared_for_id: *cared_for_id,
            preferences: NotificationPreferences {
                all_notifications,
                missed_dose_alert,
            },
            active,
        });
    }
    Ok(links)
}

/// Active subscriptions for `cared_for_id`, ordered by caregiver.
pub fn list_active_caregivers(conn: &Connection, cared_for_id: &Uuid) -> Result<Vec<CaresFor>, DatabaseError> {
    query_links(conn, cared_for_id, true)
}

pub fn list_cares_for(conn: &Connection, cared_for_id: &Uuid) -> Result<Vec<CaresFor>, DatabaseError> {
    query_links(conn, cared_for_id, false)
}
