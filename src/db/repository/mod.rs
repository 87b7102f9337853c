//! Repository layer: entity-scoped database operations.
//!
//! Free functions over a `&Connection`; callers own transactions. Each
//! user's ledger lives in its own database, so no query filters by user.

mod caregiver;
mod event;
mod history;
mod medication;
mod occurrence;
mod pillbox;
mod schedule;

pub use caregiver::*;
pub use event::*;
pub use history::*;
pub use medication::*;
pub use occurrence::*;
pub use pillbox::*;
pub use schedule::*;

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, NaiveTime, TimeZone, Utc};
    use rusqlite::Connection;
    use uuid::Uuid;

    use super::*;
    use crate::models::*;

    pub fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    pub fn daily(h: u32, m: u32) -> RecurrenceRule {
        RecurrenceRule::Daily { times: vec![NaiveTime::from_hms_opt(h, m, 0).unwrap()] }
    }

    pub fn medication(conn: &Connection, owner: Uuid, name: &str) -> Medication {
        let med = Medication::new(
            owner,
            NewMedication { name: name.into(), ..Default::default() },
            at(1, 0, 0),
        )
        .unwrap();
        insert_medication(conn, &med).unwrap();
        med
    }

    pub fn entry(conn: &Connection, med: &Medication, compartment: u8, rule: RecurrenceRule) -> ScheduleEntry {
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            medication_id: med.id,
            compartment,
            rule: Some(rule),
            starts_at: at(1, 0, 0),
            retired_at: None,
            created_at: at(1, 0, 0),
        };
        insert_schedule_entry(conn, &entry).unwrap();
        entry
    }

    pub fn occurrence(conn: &Connection, entry: &ScheduleEntry, due_at: DateTime<Utc>) -> Occurrence {
        let key = OccurrenceKey { schedule_entry_id: entry.id, due_at };
        let occ = Occurrence {
            id: key.occurrence_id(),
            schedule_entry_id: entry.id,
            medication_id: entry.medication_id,
            due_at,
            compartment: Some(entry.compartment),
        };
        insert_occurrence_if_absent(conn, &occ).unwrap();
        occ
    }
}
