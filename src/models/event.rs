use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::EventKind;

/// Write-once fact emitted by the detector or dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// The user whose dose this is about.
    pub user_id: Uuid,
    pub occurrence_id: Option<Uuid>,
    pub history_id: Option<Uuid>,
    /// Addressee of a `NotificationRaised` event.
    pub caregiver_id: Option<Uuid>,
    pub emitted_at: DateTime<Utc>,
}

impl EngineEvent {
    /// `DoseDue`/`DoseMissed` ids derive from the occurrence, so a redundant
    /// emission collapses onto the same row.
    pub fn for_occurrence(
        kind: EventKind,
        user_id: Uuid,
        occurrence_id: Uuid,
        history_id: Option<Uuid>,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v5(&occurrence_id, kind.as_str().as_bytes()),
            kind,
            user_id,
            occurrence_id: Some(occurrence_id),
            history_id,
            caregiver_id: None,
            emitted_at,
        }
    }

    /// One notification per (caregiver, occurrence).
    pub fn notification(source: &EngineEvent, caregiver_id: Uuid, emitted_at: DateTime<Utc>) -> Self {
        let seed = source.occurrence_id.unwrap_or(source.id);
        Self {
            id: Uuid::new_v5(&seed, caregiver_id.as_bytes()),
            kind: EventKind::NotificationRaised,
            user_id: source.user_id,
            occurrence_id: source.occurrence_id,
            history_id: source.history_id,
            caregiver_id: Some(caregiver_id),
            emitted_at,
        }
    }
}
