//! Notification dispatcher: fans `DoseMissed` events out to caregivers.
//!
//! Notifications are persisted as `NotificationRaised` events and then
//! handed to the delivery collaborator through an unbounded channel.
//! Delivery is fire-and-forget: a closed channel is logged, never retried.

pub mod dedup;

pub use dedup::*;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::db::repository::{insert_event_if_absent, list_active_caregivers};
use crate::error::EngineError;
use crate::models::enums::EventKind;
use crate::models::*;

/// What the delivery collaborator receives for each raised notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRequest {
    pub event_id: Uuid,
    pub caregiver_id: Uuid,
    pub cared_for_id: Uuid,
    pub occurrence_id: Option<Uuid>,
    pub history_id: Option<Uuid>,
    pub raised_at: DateTime<Utc>,
}

impl NotificationRequest {
    fn from_event(event: &EngineEvent) -> Option<Self> {
        Some(Self {
            event_id: event.id,
            caregiver_id: event.caregiver_id?,
            cared_for_id: event.user_id,
            occurrence_id: event.occurrence_id,
            history_id: event.history_id,
            raised_at: event.emitted_at,
        })
    }
}

pub struct Dispatcher {
    recent: Mutex<DedupWindow>,
    sink: Option<UnboundedSender<NotificationRequest>>,
}

impl Dispatcher {
    pub fn new(dedup_capacity: usize, sink: Option<UnboundedSender<NotificationRequest>>) -> Self {
        Self {
            recent: Mutex::new(DedupWindow::new(dedup_capacity)),
            sink,
        }
    }

    fn key_for(event: &EngineEvent, caregiver_id: Uuid) -> NotificationKey {
        NotificationKey {
            caregiver_id,
            occurrence_id: event.occurrence_id.unwrap_or(event.id),
        }
    }

    /// Write the notifications `events` call for. Returns only the ones
    /// written now; anything already raised is skipped.
    ///
    /// Runs inside the caller's transaction. Call [`Dispatcher::deliver`]
    /// with the result once that transaction has committed.
    pub fn raise(
        &self,
        conn: &Connection,
        events: &[EngineEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        let mut raised = Vec::new();
        for event in events.iter().filter(|e| e.kind == EventKind::DoseMissed) {
            for link in list_active_caregivers(conn, &event.user_id)? {
                if !link.preferences.permits(event.kind) {
                    continue;
                }
                let key = Self::key_for(event, link.caregiver_id);
                if self.recent.lock().map_err(|_| EngineError::LockPoisoned)?.contains(&key) {
                    tracing::debug!(caregiver_id = %link.caregiver_id, "notification already raised");
                    continue;
                }
                let notification = EngineEvent::notification(event, link.caregiver_id, now);
                if insert_event_if_absent(conn, &notification)? {
                    raised.push(notification);
                }
            }
        }
        Ok(raised)
    }

    /// Remember and hand committed notifications to the delivery channel.
    pub fn deliver(&self, notifications: &[EngineEvent]) -> Result<(), EngineError> {
        let mut recent = self.recent.lock().map_err(|_| EngineError::LockPoisoned)?;
        for notification in notifications {
            let Some(request) = NotificationRequest::from_event(notification) else {
                continue;
            };
            recent.insert(Self::key_for(notification, request.caregiver_id));
            tracing::info!(
                caregiver_id = %request.caregiver_id,
                cared_for_id = %request.cared_for_id,
                event_id = %request.event_id,
                "caregiver notification raised"
            );
            if let Some(sink) = &self.sink {
                if sink.send(request).is_err() {
                    tracing::warn!(event_id = %notification.id, "notification channel closed; dropping request");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::at;
    use crate::db::repository::{list_events, upsert_cares_for};
    use crate::db::sqlite::open_memory_database;

    fn missed(user: Uuid) -> EngineEvent {
        EngineEvent::for_occurrence(
            EventKind::DoseMissed,
            user,
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            at(2, 8, 31),
        )
    }

    fn subscribe(conn: &Connection, user: Uuid, all: bool, missed_alert: bool) -> Uuid {
        let caregiver = Uuid::new_v4();
        upsert_cares_for(
            conn,
            &CaresFor {
                caregiver_id: caregiver,
                cared_for_id: user,
                preferences: NotificationPreferences {
                    all_notifications: all,
                    missed_dose_alert: missed_alert,
                },
                active: true,
            },
        )
        .unwrap();
        caregiver
    }

    #[test]
    fn missed_dose_notifies_opted_in_caregivers() {
        let conn = open_memory_database().unwrap();
        let user = Uuid::new_v4();
        let alert = subscribe(&conn, user, false, true);
        let everything = subscribe(&conn, user, true, false);
        subscribe(&conn, user, false, false);

        let dispatcher = Dispatcher::new(16, None);
        let raised = dispatcher.raise(&conn, &[missed(user)], at(2, 8, 31)).unwrap();
        let mut targets: Vec<_> = raised.iter().filter_map(|e| e.caregiver_id).collect();
        targets.sort();
        let mut expected = vec![alert, everything];
        expected.sort();
        assert_eq!(targets, expected);
    }

    #[test]
    fn redelivered_event_raises_nothing_new() {
        let conn = open_memory_database().unwrap();
        let user = Uuid::new_v4();
        subscribe(&conn, user, false, true);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(16, Some(tx));
        let event = missed(user);

        let first = dispatcher.raise(&conn, &[event.clone()], at(2, 8, 31)).unwrap();
        dispatcher.deliver(&first).unwrap();
        assert_eq!(first.len(), 1);
        assert!(rx.try_recv().is_ok());

        let again = dispatcher.raise(&conn, &[event.clone()], at(2, 8, 40)).unwrap();
        assert!(again.is_empty());

        // A fresh dispatcher has no memory; the event log still refuses.
        let cold = Dispatcher::new(16, None);
        assert!(cold.raise(&conn, &[event], at(2, 9, 0)).unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        let notifications = list_events(&conn, None)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::NotificationRaised)
            .count();
        assert_eq!(notifications, 1);
    }

    #[test]
    fn due_events_are_not_dispatched() {
        let conn = open_memory_database().unwrap();
        let user = Uuid::new_v4();
        subscribe(&conn, user, true, true);
        let due = EngineEvent::for_occurrence(EventKind::DoseDue, user, Uuid::new_v4(), None, at(2, 8, 0));
        let dispatcher = Dispatcher::new(16, None);
        assert!(dispatcher.raise(&conn, &[due], at(2, 8, 0)).unwrap().is_empty());
    }

    #[test]
    fn closed_channel_does_not_fail_delivery() {
        let conn = open_memory_database().unwrap();
        let user = Uuid::new_v4();
        subscribe(&conn, user, false, true);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let dispatcher = Dispatcher::new(16, Some(tx));
        let raised = dispatcher.raise(&conn, &[missed(user)], at(2, 8, 31)).unwrap();
        assert!(dispatcher.deliver(&raised).is_ok());
    }
}
