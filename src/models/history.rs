use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::Outcome;

/// Medication involved in a history record, with its name as it was when
/// the record was written. Later renames do not rewrite history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationRef {
    pub id: Uuid,
    pub name: Option<String>,
}

/// Immutable adherence fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// `None` for a spontaneous record not bound to any occurrence.
    pub occurrence_id: Option<Uuid>,
    /// When the dose was actually taken/skipped, or the missed deadline.
    pub recorded_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub medications: Vec<MedicationRef>,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn is_spontaneous(&self) -> bool {
        self.occurrence_id.is_none()
    }
}

/// Adherence counts over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdherenceSummary {
    pub taken: u32,
    pub skipped: u32,
    pub missed: u32,
    /// Taken records with no occurrence (not counted in `taken`).
    pub spontaneous: u32,
}

impl AdherenceSummary {
    /// `taken / (taken + skipped + missed)`, or `None` with nothing due.
    pub fn adherence_ratio(&self) -> Option<f64> {
        let due = self.taken + self.skipped + self.missed;
        (due > 0).then(|| self.taken as f64 / due as f64)
    }

    pub fn tally(&mut self, record: &HistoryRecord) {
        match (record.outcome, record.is_spontaneous()) {
            (Outcome::Taken, true) => self.spontaneous += 1,
            (Outcome::Taken, false) => self.taken += 1,
            (Outcome::Skipped, _) => self.skipped += 1,
            (Outcome::Missed, _) => self.missed += 1,
        }
    }
}
