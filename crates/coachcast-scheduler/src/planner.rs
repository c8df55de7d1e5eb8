//! Decide which subscriber-days are due for delivery.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use coachcast_core::config::SchedulerConfig;
use coachcast_core::types::{DeliveryJob, Subscriber};

use crate::timezone::{delivery_instant, local_date, resolve_timezone};

pub struct Planner {
    lookahead: Duration,
    max_lateness: Duration,
    default_tz: Tz,
}

impl Planner {
    pub fn new(config: &SchedulerConfig, default_tz: Tz) -> Self {
        Self {
            lookahead: Duration::seconds(config.lookahead_secs as i64),
            max_lateness: Duration::minutes(config.max_lateness_mins as i64),
            default_tz,
        }
    }

    /// Local dates whose delivery instant falls inside the due window at `now`.
    pub fn due_dates(&self, subscriber: &Subscriber, now: DateTime<Utc>) -> Vec<(NaiveDate, DateTime<Utc>)> {
        let tz = resolve_timezone(&subscriber.timezone, self.default_tz);
        let today = local_date(now, tz);
        [today.pred_opt(), Some(today), today.succ_opt()]
            .into_iter()
            .flatten()
            .filter(|date| !subscriber.is_paused_on(*date))
            .map(|date| (date, delivery_instant(subscriber, date, tz)))
            .filter(|(_, instant)| *instant <= now + self.lookahead && now - *instant <= self.max_lateness)
            .collect()
    }

    /// Pending jobs for every due subscriber-day. Duplicates are dropped by the store.
    pub fn plan(&self, subscribers: &[Subscriber], now: DateTime<Utc>) -> Vec<DeliveryJob> {
        subscribers
            .iter()
            .filter(|s| s.active && !s.channels.is_empty())
            .flat_map(|s| {
                self.due_dates(s, now)
                    .into_iter()
                    .map(|(date, instant)| DeliveryJob::new(s.id.clone(), date, instant))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use coachcast_core::types::DeliveryStatus;

    fn planner() -> Planner {
        Planner::new(&SchedulerConfig::default(), chrono_tz::UTC)
    }

    fn subscriber(id: &str, tz: &str, h: u32) -> Subscriber {
        Subscriber::new(id, "Test", tz, NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_due_at_delivery_time() {
        let subs = vec![subscriber("u1", "Europe/Berlin", 7)];
        assert!(planner().plan(&subs, utc(10, 5, 59)).is_empty());

        let jobs = planner().plan(&subs, utc(10, 6, 0));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].content_date, date(10));
        assert_eq!(jobs[0].scheduled_for, utc(10, 6, 0));
        assert_eq!(jobs[0].next_attempt_at, jobs[0].scheduled_for);
        assert_eq!(jobs[0].status, DeliveryStatus::Pending);
    }

    #[test]
    fn test_lateness_window() {
        let subs = vec![subscriber("u1", "UTC", 7)];
        assert_eq!(planner().plan(&subs, utc(10, 10, 0)).len(), 1);
        assert!(planner().plan(&subs, utc(10, 10, 1)).is_empty());
    }

    #[test]
    fn test_lookahead() {
        let config = SchedulerConfig { lookahead_secs: 600, ..SchedulerConfig::default() };
        let planner = Planner::new(&config, chrono_tz::UTC);
        let jobs = planner.plan(&[subscriber("u1", "UTC", 7)], utc(10, 6, 50));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scheduled_for, utc(10, 7, 0));
    }

    #[test]
    fn test_local_date_ahead_of_utc() {
        // 07:00 in Tokyo on the 10th is 22:00 UTC on the 9th.
        let jobs = planner().plan(&[subscriber("u1", "Asia/Tokyo", 7)], utc(9, 22, 30));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].content_date, date(10));
    }

    #[test]
    fn test_skips_paused_inactive_and_channelless() {
        let mut paused = subscriber("paused", "UTC", 7);
        paused.paused_until = Some(date(12));
        let mut resumed = subscriber("resumed", "UTC", 7);
        resumed.paused_until = Some(date(9));
        let mut inactive = subscriber("inactive", "UTC", 7);
        inactive.active = false;
        let mut silent = subscriber("silent", "UTC", 7);
        silent.channels.clear();

        let jobs = planner().plan(&[paused, resumed, inactive, silent], utc(10, 7, 30));
        let ids: Vec<_> = jobs.iter().map(|j| j.subscriber_id.as_str()).collect();
        assert_eq!(ids, vec!["resumed"]);
    }

    #[test]
    fn test_invalid_timezone_uses_default() {
        let planner = Planner::new(&SchedulerConfig::default(), chrono_tz::Europe::Berlin);
        let jobs = planner.plan(&[subscriber("u1", "Not/AZone", 7)], utc(10, 6, 0));
        assert_eq!(jobs.len(), 1);
    }
}
