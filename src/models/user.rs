use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Validated identity handed to every engine call by the account layer.
///
/// The engine never authenticates; it trusts `user_id` and schedules in
/// `time_zone` so that a dose at 08:00 stays at 08:00 across DST changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Uuid,
    pub time_zone: Tz,
}

impl UserContext {
    pub fn new(user_id: Uuid, time_zone: Tz) -> Self {
        Self { user_id, time_zone }
    }
}
