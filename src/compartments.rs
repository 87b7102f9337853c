//! Compartment model: which medication each physical compartment holds,
//! and which schedule entries may claim it.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use uuid::Uuid;

use crate::db::repository::{
    get_medication, get_pillbox, list_entries_for_compartment, set_compartment,
};
use crate::error::EngineError;
use crate::models::*;

/// Outcome of looking up the compartment a schedule entry dispenses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompartmentResolution {
    Bound(u8),
    /// The entry's compartment does not hold its medication right now.
    /// A data-entry gap, never a missed dose.
    Unbound,
}

impl CompartmentResolution {
    pub fn index(self) -> Option<u8> {
        match self {
            CompartmentResolution::Bound(index) => Some(index),
            CompartmentResolution::Unbound => None,
        }
    }

    /// Treat `Unbound` as an error for callers that need a compartment.
    pub fn bound(self, schedule_entry_id: Uuid) -> Result<u8, EngineError> {
        self.index().ok_or(EngineError::Unbound(schedule_entry_id))
    }
}

/// Compartment bound for `entry` at the time of the call.
pub fn resolve_compartment(pillbox: &Pillbox, entry: &ScheduleEntry) -> CompartmentResolution {
    match pillbox.occupant(entry.compartment) {
        Some(held) if held == entry.medication_id => CompartmentResolution::Bound(entry.compartment),
        _ => CompartmentResolution::Unbound,
    }
}

pub(crate) fn load_pillbox(conn: &Connection, user: &UserContext) -> Result<Pillbox, EngineError> {
    get_pillbox(conn, &user.user_id)?
        .ok_or_else(|| EngineError::not_found("pillbox", user.user_id))
}

pub(crate) fn load_medication(conn: &Connection, id: &Uuid) -> Result<Medication, EngineError> {
    get_medication(conn, id)?.ok_or_else(|| EngineError::not_found("medication", id))
}

/// Instants from `now` on at which a medication may be dosed.
fn validity_span(medication: &Medication, tz: Tz, now: DateTime<Utc>) -> ActiveSpan {
    let from = match medication.validity.start_instant(tz) {
        Some(start) if start > now => start,
        _ => now,
    };
    ActiveSpan {
        from,
        until: medication.validity.end_instant(tz),
    }
}

/// Bind `medication_id` to compartment `index` as of `now`.
///
/// Rebinding a compartment away from another medication is refused while
/// that medication still has a schedule on it overlapping the new
/// medication's remaining validity.
pub fn assign(
    conn: &Connection,
    user: &UserContext,
    index: u8,
    medication_id: &Uuid,
    now: DateTime<Utc>,
) -> Result<Pillbox, EngineError> {
    let mut pillbox = load_pillbox(conn, user)?;
    let medication = load_medication(conn, medication_id)?;
    let current = pillbox.compartment_mut(index)?.medication_id;

    match current {
        Some(held) if held == medication.id => return Ok(pillbox),
        Some(held) => {
            let holder = load_medication(conn, &held)?;
            let wanted = validity_span(&medication, user.time_zone, now);
            for entry in list_entries_for_compartment(conn, index)? {
                if entry.medication_id != held {
                    continue;
                }
                if entry.active_span(&holder, user.time_zone).overlaps(&wanted) {
                    tracing::info!(
                        compartment = index,
                        held_by = %held,
                        schedule_entry_id = %entry.id,
                        "compartment assignment refused"
                    );
                    return Err(EngineError::CompartmentConflict {
                        compartment: index,
                        held_by: held,
                    });
                }
            }
        }
        None => {}
    }

    set_compartment(conn, &pillbox.id, index, Some(&medication.id))?;
    pillbox.compartment_mut(index)?.medication_id = Some(medication.id);
    tracing::debug!(compartment = index, medication_id = %medication.id, "compartment assigned");
    Ok(pillbox)
}

/// Clear compartment `index`. History is untouched; entries targeting the
/// compartment become unbound.
pub fn unassign(conn: &Connection, user: &UserContext, index: u8) -> Result<Pillbox, EngineError> {
    let mut pillbox = load_pillbox(conn, user)?;
    let slot = pillbox.compartment_mut(index)?;
    if slot.medication_id.take().is_some() {
        set_compartment(conn, &pillbox.id, index, None)?;
        tracing::debug!(compartment = index, "compartment cleared");
    }
    Ok(pillbox)
}

/// Refuse `candidate` if another entry claims the same compartment for
/// overlapping instants. Retired entries only claim up to their retirement.
pub fn check_schedule_claim(
    conn: &Connection,
    tz: Tz,
    candidate: &ScheduleEntry,
    medication: &Medication,
) -> Result<(), EngineError> {
    let span = candidate.active_span(medication, tz);
    for other in list_entries_for_compartment(conn, candidate.compartment)? {
        if other.id == candidate.id {
            continue;
        }
        let other_med = if other.medication_id == medication.id {
            medication.clone()
        } else {
            load_medication(conn, &other.medication_id)?
        };
        if other.active_span(&other_med, tz).overlaps(&span) {
            return Err(EngineError::CompartmentConflict {
                compartment: candidate.compartment,
                held_by: other.medication_id,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::repository::{insert_medication, insert_pillbox, retire_schedule_entry};
    use crate::db::sqlite::open_memory_database;
    use chrono::NaiveDate;

    fn user() -> UserContext {
        UserContext::new(Uuid::new_v4(), chrono_tz::UTC)
    }

    fn with_pillbox(conn: &Connection, user: &UserContext) -> Pillbox {
        let pillbox = Pillbox::new(user.user_id, 7, at(1, 0, 0)).unwrap();
        insert_pillbox(conn, &pillbox).unwrap();
        pillbox
    }

    #[test]
    fn resolution_requires_matching_occupant() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let med = medication(&conn, user.user_id, "Aspirin");
        let entry = entry(&conn, &med, 2, daily(8, 0));

        let pillbox = load_pillbox(&conn, &user).unwrap();
        assert_eq!(resolve_compartment(&pillbox, &entry), CompartmentResolution::Unbound);
        assert!(matches!(
            resolve_compartment(&pillbox, &entry).bound(entry.id),
            Err(EngineError::Unbound(id)) if id == entry.id
        ));

        let pillbox = assign(&conn, &user, 2, &med.id, at(1, 0, 0)).unwrap();
        assert_eq!(resolve_compartment(&pillbox, &entry), CompartmentResolution::Bound(2));
    }

    #[test]
    fn assign_refuses_compartment_with_live_schedule() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let aspirin = medication(&conn, user.user_id, "Aspirin");
        let statin = medication(&conn, user.user_id, "Statin");
        assign(&conn, &user, 3, &aspirin.id, at(1, 0, 0)).unwrap();
        entry(&conn, &aspirin, 3, daily(8, 0));

        let err = assign(&conn, &user, 3, &statin.id, at(2, 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CompartmentConflict { compartment: 3, held_by } if held_by == aspirin.id
        ));
        // Same medication again is fine.
        assign(&conn, &user, 3, &aspirin.id, at(2, 0, 0)).unwrap();
    }

    #[test]
    fn assign_over_idle_occupant_rebinds() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let aspirin = medication(&conn, user.user_id, "Aspirin");
        let statin = medication(&conn, user.user_id, "Statin");
        assign(&conn, &user, 3, &aspirin.id, at(1, 0, 0)).unwrap();

        let pillbox = assign(&conn, &user, 3, &statin.id, at(2, 0, 0)).unwrap();
        assert_eq!(pillbox.occupant(3), Some(statin.id));
    }

    #[test]
    fn assign_allowed_once_old_schedule_has_ended() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let aspirin = medication(&conn, user.user_id, "Aspirin");
        assign(&conn, &user, 1, &aspirin.id, at(1, 0, 0)).unwrap();
        let old = entry(&conn, &aspirin, 1, daily(8, 0));
        retire_schedule_entry(&conn, &old.id, at(10, 0, 0)).unwrap();

        let later = Medication::new(
            user.user_id,
            NewMedication {
                name: "Antibiotic".into(),
                validity: ValidityWindow {
                    starts_on: NaiveDate::from_ymd_opt(2024, 1, 10),
                    ends_on: None,
                },
                ..Default::default()
            },
            at(1, 0, 0),
        )
        .unwrap();
        insert_medication(&conn, &later).unwrap();

        // Still overlapping from day 5, but not once validity starts on day 10.
        let statin = medication(&conn, user.user_id, "Statin");
        assert!(assign(&conn, &user, 1, &statin.id, at(5, 0, 0)).is_err());
        assert!(assign(&conn, &user, 1, &later.id, at(5, 0, 0)).is_ok());
    }

    #[test]
    fn unassign_is_idempotent_and_bounds_checked() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let med = medication(&conn, user.user_id, "Aspirin");
        assign(&conn, &user, 5, &med.id, at(1, 0, 0)).unwrap();

        assert_eq!(unassign(&conn, &user, 5).unwrap().occupant(5), None);
        assert_eq!(unassign(&conn, &user, 5).unwrap().occupant(5), None);
        assert!(matches!(unassign(&conn, &user, 8), Err(EngineError::Validation(_))));
    }

    #[test]
    fn overlapping_claims_on_one_compartment_conflict() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let med = medication(&conn, user.user_id, "Aspirin");
        entry(&conn, &med, 4, daily(8, 0));

        let candidate = ScheduleEntry {
            id: Uuid::new_v4(),
            medication_id: med.id,
            compartment: 4,
            rule: Some(daily(20, 0)),
            starts_at: at(2, 0, 0),
            retired_at: None,
            created_at: at(2, 0, 0),
        };
        assert!(matches!(
            check_schedule_claim(&conn, user.time_zone, &candidate, &med),
            Err(EngineError::CompartmentConflict { compartment: 4, .. })
        ));

        let elsewhere = ScheduleEntry { compartment: 5, ..candidate };
        assert!(check_schedule_claim(&conn, user.time_zone, &elsewhere, &med).is_ok());
    }

    #[test]
    fn retired_claims_free_the_compartment() {
        let conn = open_memory_database().unwrap();
        let user = user();
        with_pillbox(&conn, &user);
        let med = medication(&conn, user.user_id, "Aspirin");
        let old = entry(&conn, &med, 4, daily(8, 0));
        retire_schedule_entry(&conn, &old.id, at(3, 0, 0)).unwrap();

        let candidate = ScheduleEntry {
            id: Uuid::new_v4(),
            medication_id: med.id,
            compartment: 4,
            rule: Some(daily(8, 0)),
            starts_at: at(3, 0, 0),
            retired_at: None,
            created_at: at(3, 0, 0),
        };
        assert!(check_schedule_claim(&conn, user.time_zone, &candidate, &med).is_ok());
    }
}
