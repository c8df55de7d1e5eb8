//! Quiet hours: intrusive channels wait until the window ends.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use coachcast_core::types::{ChannelKind, QuietHours, Subscriber};

use crate::timezone::local_to_utc;

/// The subscriber's own window, else the configured default.
pub fn effective_quiet_hours(subscriber: &Subscriber, default: Option<QuietHours>) -> Option<QuietHours> {
    subscriber.quiet_hours.or(default)
}

/// If local time is inside `quiet`, the UTC instant at which the window ends.
pub fn defer_past_quiet(now: DateTime<Utc>, tz: Tz, quiet: &QuietHours) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&tz);
    let time = local.time();
    if !quiet.contains(time) {
        return None;
    }

    let today = local.date_naive();
    let end_date = if quiet.wraps_midnight() && time >= quiet.start {
        today.succ_opt()?
    } else {
        today
    };
    let end = local_to_utc(tz, end_date, quiet.end);
    // A DST shift can pull the end behind us.
    Some(if end > now { end } else { now + Duration::minutes(1) })
}

/// Deferral for sending on `kind` right now, if quiet hours forbid it.
pub fn quiet_deferral(
    kind: ChannelKind,
    subscriber: &Subscriber,
    default: Option<QuietHours>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !kind.is_intrusive() {
        return None;
    }
    let quiet = effective_quiet_hours(subscriber, default)?;
    defer_past_quiet(now, tz, &quiet)
}
