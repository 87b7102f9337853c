use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::OccurrenceStatus;
use crate::db::format_ts;

/// Identity of an occurrence: the schedule entry plus the due instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OccurrenceKey {
    pub schedule_entry_id: Uuid,
    pub due_at: DateTime<Utc>,
}

impl OccurrenceKey {
    /// Stable id derived from the key, so re-evaluation yields the same row.
    pub fn occurrence_id(&self) -> Uuid {
        Uuid::new_v5(&self.schedule_entry_id, format_ts(self.due_at).as_bytes())
    }
}

/// A concrete due dose produced by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Uuid,
    pub schedule_entry_id: Uuid,
    pub medication_id: Uuid,
    pub due_at: DateTime<Utc>,
    /// `None` when the entry's compartment is unbound at evaluation time.
    pub compartment: Option<u8>,
}

impl Occurrence {
    pub fn key(&self) -> OccurrenceKey {
        OccurrenceKey {
            schedule_entry_id: self.schedule_entry_id,
            due_at: self.due_at,
        }
    }
}

/// Lifecycle of an occurrence in the ledger. `Matched` and `Missed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OccurrenceState {
    Pending,
    Matched { history_id: Uuid, resolved_at: DateTime<Utc> },
    Missed { history_id: Uuid, resolved_at: DateTime<Utc> },
}

/// Events that can move an occurrence out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A report (taken or skipped) was reconciled to the occurrence.
    Match { history_id: Uuid, at: DateTime<Utc> },
    /// The grace window elapsed without a report.
    Timeout { history_id: Uuid, at: DateTime<Utc> },
}

/// Result of applying a [`Transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(OccurrenceState),
    /// Already in the requested terminal state; nothing to do.
    NoOp,
    /// Already resolved the other way; the transition loses.
    Rejected { history_id: Uuid },
}

impl OccurrenceState {
    pub fn status(&self) -> OccurrenceStatus {
        match self {
            OccurrenceState::Pending => OccurrenceStatus::Pending,
            OccurrenceState::Matched { .. } => OccurrenceStatus::Matched,
            OccurrenceState::Missed { .. } => OccurrenceStatus::Missed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OccurrenceState::Pending)
    }

    pub fn history_id(&self) -> Option<Uuid> {
        match self {
            OccurrenceState::Pending => None,
            OccurrenceState::Matched { history_id, .. } | OccurrenceState::Missed { history_id, .. } => {
                Some(*history_id)
            }
        }
    }

    pub fn apply(&self, transition: Transition) -> TransitionOutcome {
        match (self, transition) {
            (OccurrenceState::Pending, Transition::Match { history_id, at }) => {
                TransitionOutcome::Applied(OccurrenceState::Matched { history_id, resolved_at: at })
            }
            (OccurrenceState::Pending, Transition::Timeout { history_id, at }) => {
                TransitionOutcome::Applied(OccurrenceState::Missed { history_id, resolved_at: at })
            }
            (OccurrenceState::Missed { .. }, Transition::Timeout { .. }) => TransitionOutcome::NoOp,
            (OccurrenceState::Matched { history_id, .. }, Transition::Match { .. })
            | (OccurrenceState::Matched { history_id, .. }, Transition::Timeout { .. })
            | (OccurrenceState::Missed { history_id, .. }, Transition::Match { .. }) => {
                TransitionOutcome::Rejected { history_id: *history_id }
            }
        }
    }
}

/// An occurrence as recorded in the ledger, with its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOccurrence {
    #[serde(flatten)]
    pub occurrence: Occurrence,
    pub state: OccurrenceState,
}
