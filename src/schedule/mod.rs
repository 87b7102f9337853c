//! Dose rule evaluation and wall-clock conversion in the user's zone.

pub mod evaluator;

pub use evaluator::*;

use chrono::{DateTime, Duration, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

/// Map a local wall-clock time in `tz` to an instant.
///
/// Ambiguous times (clocks falling back) resolve to the earlier instant.
/// Times skipped by a forward jump keep the offset in force before the jump,
/// so 02:30 on a spring-forward night lands at 03:30 new time.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    if let Some(dt) = tz.from_local_datetime(&local).earliest() {
        return dt.with_timezone(&Utc);
    }
    // No transition is longer than a few hours; the offset three hours
    // earlier is the pre-gap one.
    let probe = local - Duration::hours(3);
    let offset_secs = tz
        .offset_from_local_datetime(&probe)
        .earliest()
        .map(|offset| offset.fix().local_minus_utc())
        .unwrap_or(0);
    Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset_secs))))
}

pub fn utc_to_local(tz: Tz, instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(&tz).naive_local()
}
