//! Adherence reconciler: binds taken/skipped reports to occurrences and
//! appends history.
//!
//! Every function here runs inside the caller's transaction. The
//! `pending -> matched` step is a compare-and-set on the occurrence row, and
//! the unique index on `history(occurrence_id)` backs it up, so two reports
//! racing for one occurrence can never both bind to it.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::compartments::load_medication;
use crate::config::GraceWindow;
use crate::db::normalize_ts;
use crate::db::repository::{
    get_history_for_occurrence, get_occurrence, get_schedule_entry, insert_history,
    list_medication_occurrences_in_window, medication_refs,
};
use crate::db::DatabaseError;
use crate::error::EngineError;
use crate::ledger::{apply_transition, materialize_window, EntryFilter};
use crate::models::enums::Outcome;
use crate::models::*;
use crate::schedule::TimeWindow;

/// Occurrences whose due time a report at `actual` may satisfy:
/// `due - before <= actual <= due + after`.
pub fn candidate_window(grace: &GraceWindow, actual: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (actual - grace.after, actual + grace.before)
}

/// Earliest due first, then lowest schedule entry id.
fn sort_candidates(candidates: &mut [LedgerOccurrence]) {
    candidates.sort_by(|a, b| {
        (a.occurrence.due_at, a.occurrence.schedule_entry_id)
            .cmp(&(b.occurrence.due_at, b.occurrence.schedule_entry_id))
    });
}

/// Record that the user took `medication_ids` at `actual`.
///
/// Binds to the earliest pending occurrence of any listed medication within
/// the grace window. Without one, the dose is kept as a spontaneous record.
/// Fails only with `AlreadyRecorded` (the nearby dose is already tracked as
/// taken) or on persistence errors.
pub fn record_taken(
    conn: &Connection,
    user: &UserContext,
    grace: &GraceWindow,
    medication_ids: &[Uuid],
    actual: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<HistoryRecord, EngineError> {
    let actual = normalize_ts(actual);
    let now = normalize_ts(now);
    let medications = medication_refs(conn, medication_ids)?;

    if !medications.is_empty() {
        let (lo, hi) = candidate_window(grace, actual);
        let wanted: HashSet<Uuid> = medications.iter().map(|m| m.id).collect();
        materialize_window(
            conn,
            user,
            TimeWindow::new(lo, hi + Duration::seconds(1))?,
            EntryFilter::Medications(&wanted),
            None,
        )?;

        let mut candidates = Vec::new();
        for id in &wanted {
            candidates.extend(list_medication_occurrences_in_window(conn, id, lo, hi)?);
        }
        sort_candidates(&mut candidates);

        for candidate in candidates.iter().filter(|c| c.state == OccurrenceState::Pending) {
            let record = HistoryRecord {
                id: Uuid::new_v4(),
                user_id: user.user_id,
                occurrence_id: Some(candidate.occurrence.id),
                recorded_at: actual,
                outcome: Outcome::Taken,
                medications: medications.clone(),
                created_at: now,
            };
            let matched = Transition::Match { history_id: record.id, at: now };
            if !matches!(apply_transition(conn, &candidate.occurrence.id, matched)?, TransitionOutcome::Applied(_)) {
                // Resolved since we read it.
                continue;
            }
            insert_history(conn, &record)?;
            tracing::info!(
                user_id = %user.user_id,
                occurrence_id = %candidate.occurrence.id,
                history_id = %record.id,
                "dose reconciled as taken"
            );
            return Ok(record);
        }

        if let Some(err) = already_taken(conn, &candidates)? {
            return Err(err);
        }
    }

    let record = HistoryRecord {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        occurrence_id: None,
        recorded_at: actual,
        outcome: Outcome::Taken,
        medications,
        created_at: now,
    };
    insert_history(conn, &record)?;
    tracing::info!(
        user_id = %user.user_id,
        history_id = %record.id,
        "no pending dose in grace window; recorded as spontaneous"
    );
    Ok(record)
}

/// A nearby occurrence already bound to a Taken record means this report
/// repeats one we have. Skipped or missed neighbours do not count.
fn already_taken(
    conn: &Connection,
    candidates: &[LedgerOccurrence],
) -> Result<Option<EngineError>, EngineError> {
    for candidate in candidates {
        if let OccurrenceState::Matched { history_id, .. } = candidate.state {
            let taken = get_history_for_occurrence(conn, &candidate.occurrence.id)?
                .is_some_and(|h| h.outcome == Outcome::Taken);
            if taken {
                return Ok(Some(EngineError::AlreadyRecorded {
                    occurrence_id: candidate.occurrence.id,
                    history_id,
                }));
            }
        }
    }
    Ok(None)
}

/// Record that the user deliberately skipped the occurrence at `key`.
///
/// The occurrence must exist under the entry's rule; it is materialized on
/// demand if the ledger has not reached it yet.
pub fn record_skipped(
    conn: &Connection,
    user: &UserContext,
    key: OccurrenceKey,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<HistoryRecord, EngineError> {
    let key = OccurrenceKey {
        schedule_entry_id: key.schedule_entry_id,
        due_at: normalize_ts(key.due_at),
    };
    let unknown = || EngineError::UnknownOccurrence {
        schedule_entry_id: key.schedule_entry_id,
        due_at: key.due_at,
    };

    let occurrence_id = key.occurrence_id();
    let ledger = match get_occurrence(conn, &occurrence_id)? {
        Some(found) => found,
        None => {
            if get_schedule_entry(conn, &key.schedule_entry_id)?.is_none() {
                return Err(unknown());
            }
            materialize_window(
                conn,
                user,
                TimeWindow::new(key.due_at, key.due_at + Duration::seconds(1))?,
                EntryFilter::Entry(key.schedule_entry_id),
                None,
            )?;
            get_occurrence(conn, &occurrence_id)?.ok_or_else(unknown)?
        }
    };

    let medication = load_medication(conn, &ledger.occurrence.medication_id)?;
    let record = HistoryRecord {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        occurrence_id: Some(occurrence_id),
        recorded_at: normalize_ts(at),
        outcome: Outcome::Skipped,
        medications: vec![MedicationRef {
            id: medication.id,
            name: Some(medication.name),
        }],
        created_at: normalize_ts(now),
    };

    let matched = Transition::Match { history_id: record.id, at: record.created_at };
    match apply_transition(conn, &occurrence_id, matched)? {
        TransitionOutcome::Applied(_) => {}
        TransitionOutcome::Rejected { history_id } => {
            return Err(EngineError::AlreadyRecorded { occurrence_id, history_id });
        }
        TransitionOutcome::NoOp => {
            return Err(EngineError::Database(DatabaseError::ConstraintViolation(format!(
                "occurrence {occurrence_id} cannot take a skip"
            ))));
        }
    }
    insert_history(conn, &record)?;
    tracing::info!(
        user_id = %user.user_id,
        occurrence_id = %occurrence_id,
        history_id = %record.id,
        "dose recorded as skipped"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::repository::{list_history, mark_missed_if_pending};
    use crate::db::sqlite::open_memory_database;

    fn user() -> UserContext {
        UserContext::new(Uuid::new_v4(), chrono_tz::UTC)
    }

    fn grace() -> GraceWindow {
        GraceWindow::symmetric(30)
    }

    #[test]
    fn report_inside_grace_binds_to_occurrence() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let e = entry(&conn, &med, 1, daily(8, 0));

        let record = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 10), at(2, 8, 10)).unwrap();
        let key = OccurrenceKey { schedule_entry_id: e.id, due_at: at(2, 8, 0) };
        assert_eq!(record.occurrence_id, Some(key.occurrence_id()));
        assert_eq!(record.outcome, Outcome::Taken);
        assert_eq!(record.medications[0].name.as_deref(), Some("Aspirin"));

        let occ = get_occurrence(&conn, &key.occurrence_id()).unwrap().unwrap();
        assert!(matches!(occ.state, OccurrenceState::Matched { history_id, .. } if history_id == record.id));
    }

    #[test]
    fn early_report_before_grace_does_not_match() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        entry(&conn, &med, 1, daily(8, 0));

        let record = record_taken(&conn, &user, &grace(), &[med.id], at(2, 7, 29), at(2, 7, 29)).unwrap();
        assert!(record.is_spontaneous());

        let edge = record_taken(&conn, &user, &grace(), &[med.id], at(2, 7, 30), at(2, 7, 30)).unwrap();
        assert!(!edge.is_spontaneous());
    }

    #[test]
    fn earliest_due_wins_then_lowest_entry() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let a = entry(&conn, &med, 1, daily(8, 0));
        let b = entry(&conn, &med, 2, daily(8, 0));
        entry(&conn, &med, 3, daily(8, 20));
        let lowest = a.id.min(b.id);

        let first = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 15), at(2, 8, 15)).unwrap();
        let key = OccurrenceKey { schedule_entry_id: lowest, due_at: at(2, 8, 0) };
        assert_eq!(first.occurrence_id, Some(key.occurrence_id()));

        let second = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 15), at(2, 8, 15)).unwrap();
        let highest = a.id.max(b.id);
        let key = OccurrenceKey { schedule_entry_id: highest, due_at: at(2, 8, 0) };
        assert_eq!(second.occurrence_id, Some(key.occurrence_id()));
    }

    #[test]
    fn repeated_report_is_already_recorded() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        entry(&conn, &med, 1, daily(8, 0));

        let first = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 5), at(2, 8, 5)).unwrap();
        let err = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 6), at(2, 8, 6)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRecorded { history_id, .. } if history_id == first.id));
        assert_eq!(list_history(&conn, None, None).unwrap().len(), 1);
    }

    #[test]
    fn missed_occurrence_leaves_late_report_spontaneous() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let e = entry(&conn, &med, 1, daily(8, 0));
        let occ = occurrence(&conn, &e, at(2, 8, 0));
        mark_missed_if_pending(&conn, &occ.id, &Uuid::new_v4(), at(2, 8, 31)).unwrap();

        let record = record_taken(&conn, &user, &grace(), &[med.id], at(2, 8, 20), at(2, 8, 40)).unwrap();
        assert!(record.is_spontaneous());
    }

    #[test]
    fn unknown_or_empty_medications_still_recorded() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let stranger = Uuid::new_v4();
        let record = record_taken(&conn, &user, &grace(), &[stranger], at(2, 8, 0), at(2, 8, 0)).unwrap();
        assert!(record.is_spontaneous());
        assert_eq!(record.medications, vec![MedicationRef { id: stranger, name: None }]);

        let empty = record_taken(&conn, &user, &grace(), &[], at(2, 8, 0), at(2, 8, 0)).unwrap();
        assert!(empty.is_spontaneous());
        assert!(empty.medications.is_empty());
    }

    #[test]
    fn skip_requires_a_real_occurrence() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let e = entry(&conn, &med, 1, daily(8, 0));

        let bogus = OccurrenceKey { schedule_entry_id: e.id, due_at: at(2, 9, 0) };
        assert!(matches!(
            record_skipped(&conn, &user, bogus, at(2, 9, 0), at(2, 9, 0)),
            Err(EngineError::UnknownOccurrence { .. })
        ));
        let no_entry = OccurrenceKey { schedule_entry_id: Uuid::new_v4(), due_at: at(2, 8, 0) };
        assert!(matches!(
            record_skipped(&conn, &user, no_entry, at(2, 8, 0), at(2, 8, 0)),
            Err(EngineError::UnknownOccurrence { .. })
        ));
    }

    #[test]
    fn skip_in_advance_then_report_is_spontaneous() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let e = entry(&conn, &med, 1, daily(8, 0));
        let key = OccurrenceKey { schedule_entry_id: e.id, due_at: at(3, 8, 0) };

        let skipped = record_skipped(&conn, &user, key, at(2, 20, 0), at(2, 20, 0)).unwrap();
        assert_eq!(skipped.outcome, Outcome::Skipped);
        assert_eq!(skipped.occurrence_id, Some(key.occurrence_id()));

        assert!(matches!(
            record_skipped(&conn, &user, key, at(2, 21, 0), at(2, 21, 0)),
            Err(EngineError::AlreadyRecorded { .. })
        ));
        let taken = record_taken(&conn, &user, &grace(), &[med.id], at(3, 8, 0), at(3, 8, 0)).unwrap();
        assert!(taken.is_spontaneous());
    }

    #[test]
    fn skip_after_missed_names_the_missed_record() {
        let conn = open_memory_database().unwrap();
        let user = user();
        let med = medication(&conn, user.user_id, "Aspirin");
        let e = entry(&conn, &med, 1, daily(8, 0));
        let occ = occurrence(&conn, &e, at(2, 8, 0));
        let missed_history = Uuid::new_v4();
        mark_missed_if_pending(&conn, &occ.id, &missed_history, at(2, 8, 31)).unwrap();

        let err = record_skipped(&conn, &user, occ.key(), at(2, 9, 0), at(2, 9, 0)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AlreadyRecorded { occurrence_id, history_id }
                if occurrence_id == occ.id && history_id == missed_history
        ));
        assert!(list_history(&conn, None, None).unwrap().is_empty());
    }
}
