//! Occurrence ledger: writes evaluator output into a user's partition.
//!
//! Occurrences are derived data. Materializing the same window twice is a
//! no-op because rows are keyed by (schedule entry, due instant).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::compartments::{load_medication, resolve_compartment, CompartmentResolution};
use crate::db::repository::{
    advance_materialized_through, delete_pending_from, get_materialized_through, get_occurrence,
    get_pillbox, insert_occurrence_if_absent, list_occurrences_due_between, list_schedule_entries,
    mark_matched_if_pending, mark_missed_if_pending, rewind_materialized_through,
};
use crate::db::DatabaseError;
use crate::error::EngineError;
use crate::models::*;
use crate::schedule::{occurrences_in_window, TimeWindow};

/// Cooperative cancellation flag for long evaluations.
///
/// Clones share the flag. Work observes it between occurrences; a
/// cancelled evaluation leaves its transaction uncommitted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Which schedule entries a materialization pass covers.
pub(crate) enum EntryFilter<'a> {
    All,
    Medications(&'a HashSet<Uuid>),
    Entry(Uuid),
}

impl EntryFilter<'_> {
    fn admits(&self, entry: &ScheduleEntry) -> bool {
        match self {
            EntryFilter::All => true,
            EntryFilter::Medications(ids) => ids.contains(&entry.medication_id),
            EntryFilter::Entry(id) => entry.id == *id,
        }
    }
}

/// Insert the occurrences due in `window` for every admitted entry.
/// Returns the number of new rows.
pub(crate) fn materialize_window(
    conn: &Connection,
    user: &UserContext,
    window: TimeWindow,
    filter: EntryFilter<'_>,
    cancel: Option<&CancelToken>,
) -> Result<usize, EngineError> {
    let pillbox = get_pillbox(conn, &user.user_id)?;
    let mut medications: HashMap<Uuid, Medication> = HashMap::new();
    let mut written = 0;

    for entry in list_schedule_entries(conn, true)? {
        if !filter.admits(&entry) {
            continue;
        }
        if let Some(token) = cancel {
            token.check()?;
        }
        if !medications.contains_key(&entry.medication_id) {
            let med = load_medication(conn, &entry.medication_id)?;
            medications.insert(med.id, med);
        }
        let Some(medication) = medications.get(&entry.medication_id) else {
            continue;
        };
        // Everything before the cursor is already in the ledger.
        let from = match get_materialized_through(conn, &entry.id)? {
            Some(cursor) if cursor > window.from => cursor,
            _ => window.from,
        };
        if from >= window.to {
            continue;
        }
        let window = TimeWindow::new(from, window.to)?;
        written += materialize_entry(conn, user, pillbox.as_ref(), &entry, medication, window, cancel)?;
    }

    if written > 0 {
        tracing::debug!(user_id = %user.user_id, written, "occurrences materialized");
    }
    Ok(written)
}

fn materialize_entry(
    conn: &Connection,
    user: &UserContext,
    pillbox: Option<&Pillbox>,
    entry: &ScheduleEntry,
    medication: &Medication,
    window: TimeWindow,
    cancel: Option<&CancelToken>,
) -> Result<usize, EngineError> {
    let resolution = pillbox
        .map(|p| resolve_compartment(p, entry))
        .unwrap_or(CompartmentResolution::Unbound);

    let mut written = 0;
    for occurrence in occurrences_in_window(entry, medication, user.time_zone, window, resolution.index())? {
        if let Some(token) = cancel {
            token.check()?;
        }
        if insert_occurrence_if_absent(conn, &occurrence)? {
            written += 1;
        }
    }

    if written > 0 && resolution == CompartmentResolution::Unbound {
        tracing::warn!(
            user_id = %user.user_id,
            schedule_entry_id = %entry.id,
            compartment = entry.compartment,
            "schedule entry has no bound compartment; occurrences recorded without one"
        );
    }
    Ok(written)
}

/// Bring every entry's ledger up to `through` (exclusive), resuming from
/// where the previous pass stopped.
pub(crate) fn materialize_through(
    conn: &Connection,
    user: &UserContext,
    through: DateTime<Utc>,
    cancel: Option<&CancelToken>,
) -> Result<usize, EngineError> {
    let pillbox = get_pillbox(conn, &user.user_id)?;
    let mut written = 0;

    for entry in list_schedule_entries(conn, true)? {
        let from = get_materialized_through(conn, &entry.id)?.unwrap_or(entry.starts_at);
        if from >= through {
            continue;
        }
        if entry.retired_at.is_some_and(|retired| retired <= from) {
            continue;
        }
        let medication = load_medication(conn, &entry.medication_id)?;
        let window = TimeWindow::new(from, through)?;
        written += materialize_entry(conn, user, pillbox.as_ref(), &entry, &medication, window, cancel)?;
        advance_materialized_through(conn, &entry.id, through)?;
    }
    Ok(written)
}

/// Materialize `window` and return the ledger's view of it, ordered by due
/// time then schedule entry.
pub(crate) fn evaluate_window(
    conn: &Connection,
    user: &UserContext,
    window: TimeWindow,
    cancel: Option<&CancelToken>,
) -> Result<Vec<LedgerOccurrence>, EngineError> {
    materialize_window(conn, user, window, EntryFilter::All, cancel)?;
    if let Some(token) = cancel {
        token.check()?;
    }
    Ok(list_occurrences_due_between(conn, window.from, window.to)?)
}

/// Move an occurrence through its state machine.
///
/// The stored state decides the outcome; only an `Applied` outcome is
/// written, and the write is conditional on the row still being pending.
/// A writer that loses that race gets the outcome against the state the
/// winner left behind.
pub(crate) fn apply_transition(
    conn: &Connection,
    occurrence_id: &Uuid,
    transition: Transition,
) -> Result<TransitionOutcome, EngineError> {
    let load = || -> Result<LedgerOccurrence, EngineError> {
        get_occurrence(conn, occurrence_id)?.ok_or_else(|| EngineError::not_found("occurrence", occurrence_id))
    };

    let outcome = load()?.state.apply(transition);
    if !matches!(outcome, TransitionOutcome::Applied(_)) {
        return Ok(outcome);
    }

    let written = match transition {
        Transition::Match { history_id, at } => mark_matched_if_pending(conn, occurrence_id, &history_id, at)?,
        Transition::Timeout { history_id, at } => mark_missed_if_pending(conn, occurrence_id, &history_id, at)?,
    };
    if written {
        return Ok(outcome);
    }
    match load()?.state.apply(transition) {
        TransitionOutcome::Applied(_) => Err(EngineError::Database(DatabaseError::ConstraintViolation(format!(
            "occurrence {occurrence_id} is pending but refused the transition"
        )))),
        lost => Ok(lost),
    }
}

/// Rebuild pending occurrences from `now` on after the user's time zone
/// changed. Resolved occurrences keep their instants.
pub(crate) fn rezone_pending(conn: &Connection, user: &UserContext, now: DateTime<Utc>) -> Result<usize, EngineError> {
    let mut dropped = 0;
    for entry in list_schedule_entries(conn, true)? {
        dropped += delete_pending_from(conn, &entry.id, now)?;
        rewind_materialized_through(conn, &entry.id, now)?;
    }
    tracing::info!(
        user_id = %user.user_id,
        time_zone = %user.time_zone,
        dropped,
        "pending occurrences rebuilt for new time zone"
    );
    Ok(dropped)
}
