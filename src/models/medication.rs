use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::RecurrenceRule;
use crate::error::EngineError;
use crate::schedule::local_to_utc;

/// Inclusive range of calendar days (in the user's time zone) during which
/// a medication may be dosed. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
}

impl ValidityWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let (Some(start), Some(end)) = (self.starts_on, self.ends_on) {
            if end < start {
                return Err(EngineError::Validation(format!(
                    "validity window ends ({end}) before it starts ({start})"
                )));
            }
        }
        Ok(())
    }

    /// First instant covered: local midnight of `starts_on`.
    pub fn start_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.starts_on
            .map(|day| local_to_utc(tz, day.and_hms_opt(0, 0, 0).unwrap_or_default()))
    }

    /// First instant no longer covered: local midnight after `ends_on`.
    pub fn end_instant(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.ends_on.map(|day| {
            let next = day + Duration::days(1);
            local_to_utc(tz, next.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
    }
}

/// Input for registering a medication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMedication {
    pub name: String,
    #[serde(default)]
    pub default_rule: Option<RecurrenceRule>,
    #[serde(default)]
    pub validity: ValidityWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// Rule inherited by schedule entries that carry none of their own.
    pub default_rule: Option<RecurrenceRule>,
    pub validity: ValidityWindow,
    pub created_at: DateTime<Utc>,
}

impl Medication {
    pub fn new(owner_id: Uuid, input: NewMedication, created_at: DateTime<Utc>) -> Result<Self, EngineError> {
        let name = validate_name(&input.name)?;
        input.validity.validate()?;
        if let Some(rule) = &input.default_rule {
            rule.validate()?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            owner_id,
            name,
            default_rule: input.default_rule,
            validity: input.validity,
            created_at,
        })
    }
}

pub(crate) fn validate_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("medication name must not be empty".into()));
    }
    if name.chars().count() > 200 {
        return Err(EngineError::Validation("medication name exceeds 200 characters".into()));
    }
    Ok(name.to_string())
}
