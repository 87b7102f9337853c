//! Turns a schedule entry's recurrence rule into concrete due instants.
//!
//! Evaluation is pure: the same entry, medication, zone and window always
//! produce the same occurrences in the same order. Nothing here touches the
//! ledger.

use std::collections::VecDeque;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

use super::{local_to_utc, utc_to_local};
use crate::error::EngineError;
use crate::models::*;

/// Half-open instant window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, EngineError> {
        if to < from {
            return Err(EngineError::Validation(format!(
                "window ends ({to}) before it starts ({from})"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant < self.to
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// Narrow to the instants an entry can be active in.
    pub fn clip(&self, span: &ActiveSpan) -> TimeWindow {
        let from = self.from.max(span.from);
        let to = span.until.map_or(self.to, |until| self.to.min(until));
        TimeWindow { from, to: to.max(from) }
    }
}

/// Local times applicable on a given calendar day.
#[derive(Debug, Clone)]
enum CalendarTimes {
    Daily(Vec<NaiveTime>),
    Weekly(Vec<WeeklySlot>),
}

impl CalendarTimes {
    fn on(&self, day: NaiveDate) -> Vec<NaiveTime> {
        match self {
            CalendarTimes::Daily(times) => times.clone(),
            CalendarTimes::Weekly(slots) => slots
                .iter()
                .filter(|slot| slot.weekday == day.weekday())
                .map(|slot| slot.time)
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    Calendar {
        times: CalendarTimes,
        tz: Tz,
        day: NaiveDate,
        last_day: NaiveDate,
        buffer: VecDeque<DateTime<Utc>>,
    },
    Interval {
        next: DateTime<Utc>,
        step: Duration,
    },
    Once(Option<DateTime<Utc>>),
}

/// Lazy, finite sequence of occurrences in strictly increasing due order.
///
/// Cloning yields an independent iterator positioned at the same point, so a
/// fresh clone taken before iteration replays the sequence.
#[derive(Debug, Clone)]
pub struct OccurrenceIter {
    cursor: Cursor,
    window: TimeWindow,
    schedule_entry_id: uuid::Uuid,
    medication_id: uuid::Uuid,
    compartment: Option<u8>,
    last: Option<DateTime<Utc>>,
}

impl OccurrenceIter {
    fn next_instant(&mut self) -> Option<DateTime<Utc>> {
        let window = self.window;
        match &mut self.cursor {
            Cursor::Calendar { times, tz, day, last_day, buffer } => loop {
                if let Some(instant) = buffer.pop_front() {
                    return Some(instant);
                }
                if *day > *last_day {
                    return None;
                }
                let mut instants: Vec<_> = times
                    .on(*day)
                    .into_iter()
                    .map(|time| local_to_utc(*tz, day.and_time(time)))
                    .filter(|instant| window.contains(*instant))
                    .collect();
                // Forward DST jumps can reorder or merge times within a day.
                instants.sort();
                instants.dedup();
                buffer.extend(instants);
                match day.succ_opt() {
                    Some(next) => *day = next,
                    None => *last_day = NaiveDate::MIN,
                }
            },
            Cursor::Interval { next, step } => {
                let instant = *next;
                if instant >= window.to {
                    return None;
                }
                *next = instant + *step;
                Some(instant)
            }
            Cursor::Once(at) => at.take().filter(|instant| window.contains(*instant)),
        }
    }
}

impl Iterator for OccurrenceIter {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        loop {
            let due_at = self.next_instant()?;
            if self.last.is_some_and(|last| due_at <= last) {
                continue;
            }
            self.last = Some(due_at);
            let key = OccurrenceKey {
                schedule_entry_id: self.schedule_entry_id,
                due_at,
            };
            return Some(Occurrence {
                id: key.occurrence_id(),
                schedule_entry_id: self.schedule_entry_id,
                medication_id: self.medication_id,
                due_at,
                compartment: self.compartment,
            });
        }
    }
}

/// Occurrences of `entry` due in `window`, clipped to the entry's lifetime and
/// the medication's validity. `compartment` is the resolved compartment for
/// the produced occurrences (`None` when unbound).
pub fn occurrences_in_window(
    entry: &ScheduleEntry,
    medication: &Medication,
    tz: Tz,
    window: TimeWindow,
    compartment: Option<u8>,
) -> Result<OccurrenceIter, EngineError> {
    if entry.medication_id != medication.id {
        return Err(EngineError::Validation(format!(
            "schedule entry {} does not belong to medication {}",
            entry.id, medication.id
        )));
    }
    let rule = entry.effective_rule(medication)?;
    rule.validate()?;

    let window = window.clip(&entry.active_span(medication, tz));
    let cursor = if window.is_empty() {
        Cursor::Once(None)
    } else {
        cursor_for(rule, tz, &window)
    };

    Ok(OccurrenceIter {
        cursor,
        window,
        schedule_entry_id: entry.id,
        medication_id: medication.id,
        compartment,
        last: None,
    })
}

fn cursor_for(rule: &RecurrenceRule, tz: Tz, window: &TimeWindow) -> Cursor {
    let calendar = |times: CalendarTimes| {
        // One day of slack either side covers offsets up to +/-24h.
        let first = utc_to_local(tz, window.from).date();
        let last = utc_to_local(tz, window.to).date();
        Cursor::Calendar {
            times,
            tz,
            day: first.pred_opt().unwrap_or(first),
            last_day: last.succ_opt().unwrap_or(last),
            buffer: VecDeque::new(),
        }
    };

    match rule {
        RecurrenceRule::Daily { times } => calendar(CalendarTimes::Daily(times.clone())),
        RecurrenceRule::Weekly { slots } => calendar(CalendarTimes::Weekly(slots.clone())),
        RecurrenceRule::EveryNHours { hours, anchor } => {
            let step = Duration::hours(i64::from(*hours));
            let start = window.from.max(*anchor);
            let elapsed = (start - *anchor).num_seconds();
            let step_secs = step.num_seconds();
            let periods = (elapsed + step_secs - 1) / step_secs;
            Cursor::Interval {
                next: *anchor + Duration::seconds(periods * step_secs),
                step,
            }
        }
        RecurrenceRule::Once { at } => Cursor::Once(Some(*at)),
    }
}
