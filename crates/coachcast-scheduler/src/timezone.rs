//! Local wall-clock times to UTC instants.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::types::Subscriber;

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CoachcastError::InvalidTimezone(name.to_string()))
}

/// Parse `name`, falling back to `fallback` when it is not a known IANA zone.
pub fn resolve_timezone(name: &str, fallback: Tz) -> Tz {
    match parse_timezone(name) {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Unknown timezone '{name}', using {fallback}");
            fallback
        }
    }
}

/// The UTC instant of a local date and time.
///
/// A time inside a DST gap moves to the first valid minute after the gap.
/// A time repeated by a DST fold resolves to its earlier occurrence.
pub fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut probe = naive;
            // Gaps are at most a few hours; a day of probing is plenty.
            for _ in 0..(24 * 60) {
                probe += Duration::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

/// When `subscriber` should receive the content for `date`.
pub fn delivery_instant(subscriber: &Subscriber, date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    local_to_utc(tz, date, subscriber.delivery_time)
}

pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}
