//! Deviation detector: moves overdue occurrences to `Missed` and emits the
//! matching events.
//!
//! A scan is safe to repeat or to run concurrently with reports. Each
//! transition is a conditional update on a still-pending row, and event ids
//! derive from the occurrence, so a redundant scan writes nothing new.

pub mod scanner;

pub use scanner::*;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::GraceWindow;
use crate::db::normalize_ts;
use crate::db::repository::{
    get_medication, insert_event_if_absent, insert_history, list_pending_due_before,
    list_unannounced_due, mark_due_announced,
};
use crate::error::EngineError;
use crate::ledger::{apply_transition, materialize_through, CancelToken};
use crate::models::enums::{EventKind, Outcome};
use crate::models::*;

/// What one scan of a partition did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Occurrences newly written to the ledger.
    pub materialized: usize,
    /// `DoseDue` events emitted.
    pub due: Vec<EngineEvent>,
    /// `DoseMissed` events emitted, one per newly missed occurrence.
    pub missed: Vec<EngineEvent>,
    /// Caregiver notifications raised for `missed`. Filled in by the engine
    /// once the scan has committed.
    pub notifications: Vec<EngineEvent>,
}

/// True once `now` is past the occurrence's grace window.
pub fn is_overdue(grace: &GraceWindow, due_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > due_at + grace.after
}

/// Scan one user's ledger at `now`.
///
/// Occurrences are materialized up to `now`, overdue ones are marked missed
/// with a history record at their deadline, and occurrences that just came
/// due get a `DoseDue` event.
pub fn scan_missed(
    conn: &Connection,
    user: &UserContext,
    grace: &GraceWindow,
    now: DateTime<Utc>,
    cancel: Option<&CancelToken>,
) -> Result<ScanReport, EngineError> {
    let now = normalize_ts(now);
    let mut report = ScanReport {
        materialized: materialize_through(conn, user, now + Duration::seconds(1), cancel)?,
        ..Default::default()
    };

    for pending in list_pending_due_before(conn, now - grace.after)? {
        let occurrence = &pending.occurrence;
        if !is_overdue(grace, occurrence.due_at, now) {
            continue;
        }
        let deadline = occurrence.due_at + grace.after;
        let history_id = Uuid::new_v4();
        let timeout = Transition::Timeout { history_id, at: now };
        if !matches!(apply_transition(conn, &occurrence.id, timeout)?, TransitionOutcome::Applied(_)) {
            continue;
        }

        let name = get_medication(conn, &occurrence.medication_id)?.map(|m| m.name);
        insert_history(
            conn,
            &HistoryRecord {
                id: history_id,
                user_id: user.user_id,
                occurrence_id: Some(occurrence.id),
                recorded_at: deadline,
                outcome: Outcome::Missed,
                medications: vec![MedicationRef {
                    id: occurrence.medication_id,
                    name,
                }],
                created_at: now,
            },
        )?;

        let event = EngineEvent::for_occurrence(
            EventKind::DoseMissed,
            user.user_id,
            occurrence.id,
            Some(history_id),
            now,
        );
        if insert_event_if_absent(conn, &event)? {
            tracing::info!(
                user_id = %user.user_id,
                occurrence_id = %occurrence.id,
                due_at = %occurrence.due_at,
                "dose missed"
            );
            report.missed.push(event);
        }
    }

    for pending in list_unannounced_due(conn, now)? {
        let occurrence = &pending.occurrence;
        if !mark_due_announced(conn, &occurrence.id)? {
            continue;
        }
        let event = EngineEvent::for_occurrence(EventKind::DoseDue, user.user_id, occurrence.id, None, now);
        if insert_event_if_absent(conn, &event)? {
            report.due.push(event);
        }
    }

    if !report.missed.is_empty() || !report.due.is_empty() {
        tracing::debug!(
            user_id = %user.user_id,
            missed = report.missed.len(),
            due = report.due.len(),
            materialized = report.materialized,
            "scan complete"
        );
    }
    Ok(report)
}
