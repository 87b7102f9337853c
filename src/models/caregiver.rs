use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::EventKind;

/// Which deviations a caregiver wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub all_notifications: bool,
    pub missed_dose_alert: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            all_notifications: false,
            missed_dose_alert: true,
        }
    }
}

impl NotificationPreferences {
    pub fn permits(&self, kind: EventKind) -> bool {
        if self.all_notifications {
            return true;
        }
        match kind {
            EventKind::DoseMissed => self.missed_dose_alert,
            EventKind::DoseDue | EventKind::NotificationRaised => false,
        }
    }
}

/// Subscription of a caregiver to a cared-for user.
///
/// Lifecycle is owned by account management; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaresFor {
    pub caregiver_id: Uuid,
    pub cared_for_id: Uuid,
    pub preferences: NotificationPreferences,
    pub active: bool,
}
