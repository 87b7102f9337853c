use std::collections::HashSet;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::medication::Medication;
use crate::error::EngineError;

/// Longest supported interval for `EveryNHours`: one week.
pub const MAX_INTERVAL_HOURS: u32 = 24 * 7;

/// Most dosing times a single daily rule may carry.
const MAX_DAILY_TIMES: usize = 48;

/// A weekday + local time-of-day pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeeklySlot {
    pub weekday: Weekday,
    pub time: NaiveTime,
}

/// Recurrence rules understood by the evaluator.
///
/// `Daily` and `Weekly` times are wall-clock times in the user's zone.
/// `EveryNHours` counts elapsed hours from an absolute anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceRule {
    Daily { times: Vec<NaiveTime> },
    Weekly { slots: Vec<WeeklySlot> },
    EveryNHours { hours: u32, anchor: DateTime<Utc> },
    /// A single dose at a fixed instant.
    Once { at: DateTime<Utc> },
}

impl RecurrenceRule {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            RecurrenceRule::Daily { times } => {
                if times.is_empty() {
                    return Err(invalid("daily rule needs at least one time of day"));
                }
                if times.len() > MAX_DAILY_TIMES {
                    return Err(invalid(format!("daily rule exceeds {MAX_DAILY_TIMES} times")));
                }
                if times.iter().any(|t| t.nanosecond() != 0) {
                    return Err(invalid("times of day must be whole seconds"));
                }
                let unique: HashSet<_> = times.iter().collect();
                if unique.len() != times.len() {
                    return Err(invalid("daily rule repeats a time of day"));
                }
            }
            RecurrenceRule::Weekly { slots } => {
                if slots.is_empty() {
                    return Err(invalid("weekly rule needs at least one slot"));
                }
                if slots.len() > MAX_DAILY_TIMES * 7 {
                    return Err(invalid("weekly rule has too many slots"));
                }
                if slots.iter().any(|s| s.time.nanosecond() != 0) {
                    return Err(invalid("times of day must be whole seconds"));
                }
                let unique: HashSet<_> = slots.iter().collect();
                if unique.len() != slots.len() {
                    return Err(invalid("weekly rule repeats a slot"));
                }
            }
            RecurrenceRule::EveryNHours { hours, anchor } => {
                if *hours == 0 || *hours > MAX_INTERVAL_HOURS {
                    return Err(invalid(format!(
                        "interval of {hours}h outside 1..={MAX_INTERVAL_HOURS}"
                    )));
                }
                if anchor.timestamp_subsec_nanos() != 0 {
                    return Err(invalid("interval anchor must be whole seconds"));
                }
            }
            RecurrenceRule::Once { at } => {
                if at.timestamp_subsec_nanos() != 0 {
                    return Err(invalid("one-off dose time must be whole seconds"));
                }
            }
        }
        Ok(())
    }

    /// Parse a stored rule. Anything unreadable is an invalid rule.
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let rule: RecurrenceRule = serde_json::from_str(raw)
            .map_err(|e| invalid(format!("unreadable rule: {e}")))?;
        rule.validate()?;
        Ok(rule)
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidRecurrenceRule(msg.into())
}

/// Half-open instant range `[from, until)`; `until = None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpan {
    pub from: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl ActiveSpan {
    pub fn is_empty(&self) -> bool {
        self.until.is_some_and(|until| until <= self.from)
    }

    pub fn overlaps(&self, other: &ActiveSpan) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let self_before_other_ends = other.until.map_or(true, |end| self.from < end);
        let other_before_self_ends = self.until.map_or(true, |end| other.from < end);
        self_before_other_ends && other_before_self_ends
    }
}

/// Input for creating a schedule entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NewScheduleEntry {
    pub medication_id: Uuid,
    pub compartment: u8,
    /// Falls back to the medication's default rule when absent.
    #[serde(default)]
    pub rule: Option<RecurrenceRule>,
    /// Defaults to the creation time.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

/// Binds a medication to a recurrence rule and a target compartment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub medication_id: Uuid,
    pub compartment: u8,
    pub rule: Option<RecurrenceRule>,
    /// No occurrence is due before this instant.
    pub starts_at: DateTime<Utc>,
    /// No occurrence is due at or after this instant.
    pub retired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn effective_rule<'a>(
        &'a self,
        medication: &'a Medication,
    ) -> Result<&'a RecurrenceRule, EngineError> {
        self.rule
            .as_ref()
            .or(medication.default_rule.as_ref())
            .ok_or_else(|| {
                invalid(format!(
                    "schedule entry {} has no rule and medication {} has no default",
                    self.id, medication.id
                ))
            })
    }

    /// Instants during which this entry can produce occurrences: its own
    /// lifetime intersected with the medication's validity window.
    pub fn active_span(&self, medication: &Medication, tz: Tz) -> ActiveSpan {
        let from = match medication.validity.start_instant(tz) {
            Some(start) if start > self.starts_at => start,
            _ => self.starts_at,
        };
        let until = match (self.retired_at, medication.validity.end_instant(tz)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ActiveSpan { from, until }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    #[test]
    fn daily_rule_validation() {
        assert!(RecurrenceRule::Daily { times: vec![t(8, 0), t(20, 0)] }.validate().is_ok());
        assert!(RecurrenceRule::Daily { times: vec![] }.validate().is_err());
        assert!(RecurrenceRule::Daily { times: vec![t(8, 0), t(8, 0)] }.validate().is_err());
    }

    #[test]
    fn interval_bounds() {
        let anchor = ts(1, 0);
        assert!(RecurrenceRule::EveryNHours { hours: 0, anchor }.validate().is_err());
        assert!(RecurrenceRule::EveryNHours { hours: 8, anchor }.validate().is_ok());
        assert!(RecurrenceRule::EveryNHours { hours: 169, anchor }.validate().is_err());
    }

    #[test]
    fn subsecond_anchor_rejected() {
        let anchor = ts(1, 0) + chrono::Duration::milliseconds(5);
        let err = RecurrenceRule::EveryNHours { hours: 6, anchor }.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecurrenceRule(_)));
    }

    #[test]
    fn rule_json_shape() {
        let rule = RecurrenceRule::from_json(r#"{"kind":"daily","times":["08:00:00"]}"#).unwrap();
        assert_eq!(rule, RecurrenceRule::Daily { times: vec![t(8, 0)] });

        let weekly = RecurrenceRule::from_json(
            r#"{"kind":"weekly","slots":[{"weekday":"Mon","time":"09:30:00"}]}"#,
        )
        .unwrap();
        assert_eq!(
            weekly,
            RecurrenceRule::Weekly { slots: vec![WeeklySlot { weekday: Weekday::Mon, time: t(9, 30) }] }
        );
    }

    #[test]
    fn unknown_kind_is_invalid_rule() {
        let err = RecurrenceRule::from_json(r#"{"kind":"monthly","day":1}"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecurrenceRule(_)));
        assert!(RecurrenceRule::from_json("not json").is_err());
    }

    #[test]
    fn span_overlap() {
        let a = ActiveSpan { from: ts(1, 0), until: Some(ts(5, 0)) };
        let b = ActiveSpan { from: ts(4, 0), until: None };
        let c = ActiveSpan { from: ts(5, 0), until: Some(ts(6, 0)) };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c), "touching half-open spans do not overlap");
        assert!(b.overlaps(&c));
    }

    #[test]
    fn empty_span_never_overlaps() {
        let empty = ActiveSpan { from: ts(3, 0), until: Some(ts(3, 0)) };
        let all = ActiveSpan { from: ts(1, 0), until: None };
        assert!(empty.is_empty());
        assert!(!empty.overlaps(&all));
    }
}
