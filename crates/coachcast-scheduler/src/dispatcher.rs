//! Queue worker: claim due jobs and push each one through its channels.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use coachcast_channels::{ChannelRegistry, render_notification};
use coachcast_core::config::{AppConfig, SchedulerConfig};
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::types::{DeliveryJob, QuietHours, Subscriber};
use coachcast_store::DeliveryStore;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;

use crate::quiet::quiet_deferral;
use crate::retry::{NextStep, RetryPolicy};
use crate::timezone::resolve_timezone;

/// Counts from one dispatch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub fallbacks: usize,
    pub deferred: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs that hit a store error mid-flight; left for stale-claim recovery.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    Fallback,
    Deferred,
    Failed,
    Cancelled,
}

impl DispatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Fallback => self.fallbacks += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub struct Dispatcher {
    store: Arc<DeliveryStore>,
    channels: Arc<ChannelRegistry>,
    app: AppConfig,
    batch_size: usize,
    concurrency: usize,
    content_wait: Duration,
    content_retry: Duration,
    max_lateness: Duration,
    retry: RetryPolicy,
    quiet_default: Option<QuietHours>,
    default_tz: Tz,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DeliveryStore>,
        channels: Arc<ChannelRegistry>,
        app: AppConfig,
        scheduler: &SchedulerConfig,
        retry: RetryPolicy,
        quiet_default: Option<QuietHours>,
        default_tz: Tz,
    ) -> Self {
        Self {
            store,
            channels,
            app,
            batch_size: scheduler.batch_size.max(1),
            concurrency: scheduler.concurrency.max(1),
            content_wait: Duration::minutes(scheduler.content_wait_mins as i64),
            content_retry: Duration::seconds(scheduler.content_retry_secs.max(1) as i64),
            max_lateness: Duration::minutes(scheduler.max_lateness_mins as i64),
            retry,
            quiet_default,
            default_tz,
        }
    }

    /// Claim up to a batch of due jobs and process them concurrently.
    pub async fn dispatch_batch(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let jobs = self.store.claim_due(now, self.batch_size)?;
        let mut report = DispatchReport { claimed: jobs.len(), ..Default::default() };
        if jobs.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<(String, Result<Outcome>)> = futures::stream::iter(jobs)
            .map(|job| async move {
                let id = job.id.clone();
                (id, self.process(job, now).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (job_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!("Delivery job {job_id} errored: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Whether each of the subscriber's preferred channels can be used.
    fn reachable(&self, subscriber: &Subscriber) -> Vec<bool> {
        subscriber
            .channels
            .iter()
            .map(|kind| self.channels.get(*kind).is_some_and(|c| c.can_reach(subscriber)))
            .collect()
    }

    async fn process(&self, mut job: DeliveryJob, now: DateTime<Utc>) -> Result<Outcome> {
        let Some(subscriber) = self.store.get_subscriber(&job.subscriber_id)? else {
            self.store.mark_failed(&mut job, "subscriber not found", now)?;
            return Ok(Outcome::Failed);
        };
        if !subscriber.active {
            self.store.mark_cancelled(&mut job, "subscriber inactive", now)?;
            return Ok(Outcome::Cancelled);
        }
        if subscriber.is_paused_on(job.content_date) {
            // Held rather than cancelled: a resume inside the lateness window
            // still delivers, and the planner cannot enqueue the date twice.
            if now - job.scheduled_for < self.max_lateness {
                job.next_attempt_at = now + self.content_retry;
                job.last_error = Some("subscriber paused".into());
                self.store.reschedule(&mut job)?;
                tracing::debug!("{} is paused, holding {}", subscriber.id, job.content_date);
                return Ok(Outcome::Deferred);
            }
            self.store.mark_cancelled(&mut job, "subscriber paused", now)?;
            return Ok(Outcome::Cancelled);
        }

        let Some(content) = self.store.get_content(&subscriber.id, job.content_date)? else {
            if now - job.scheduled_for < self.content_wait {
                job.next_attempt_at = now + self.content_retry;
                job.last_error = Some("content not ready".into());
                self.store.reschedule(&mut job)?;
                tracing::debug!("Content for {} on {} not ready, deferring", subscriber.id, job.content_date);
                return Ok(Outcome::Deferred);
            }
            self.store.mark_failed(&mut job, "no content for date", now)?;
            tracing::warn!("No content for {} on {}, giving up", subscriber.id, job.content_date);
            return Ok(Outcome::Failed);
        };

        let reachable = self.reachable(&subscriber);
        let Some(index) = reachable
            .iter()
            .enumerate()
            .skip(job.channel_index as usize)
            .find(|(_, ok)| **ok)
            .map(|(i, _)| i)
        else {
            self.store.mark_failed(&mut job, "no reachable channel", now)?;
            tracing::warn!("No reachable channel left for {}", subscriber.id);
            return Ok(Outcome::Failed);
        };
        if index as u32 != job.channel_index {
            job.channel_index = index as u32;
            job.attempts = 0;
        }

        let kind = subscriber.channels[index];
        let channel = self
            .channels
            .get(kind)
            .ok_or_else(|| CoachcastError::ChannelNotConfigured(kind.to_string()))?;
        job.channel = Some(kind);

        let tz = resolve_timezone(&subscriber.timezone, self.default_tz);
        if let Some(at) = quiet_deferral(kind, &subscriber, self.quiet_default, tz, now) {
            job.next_attempt_at = at;
            self.store.reschedule(&mut job)?;
            tracing::debug!("Quiet hours for {} on {kind}, deferring to {at}", subscriber.id);
            return Ok(Outcome::Deferred);
        }

        let notification = render_notification(&self.app, &subscriber, &content);
        job.attempts += 1;
        job.total_attempts += 1;

        match channel.deliver(&subscriber, &notification).await {
            Ok(receipt) => {
                self.store.record_attempt(&job.id, kind, job.total_attempts, true, None, now)?;
                self.store.mark_delivered(&mut job, kind, receipt.provider_message_id, now)?;
                tracing::info!("✅ Delivered {} for {} via {}", job.content_date, subscriber.id, channel.name());
                Ok(Outcome::Delivered)
            }
            Err(e) => {
                let message = e.to_string();
                self.store.record_attempt(&job.id, kind, job.total_attempts, false, Some(&message), now)?;
                job.last_error = Some(message.clone());

                match self.retry.next_step(&job, &e, &reachable, now) {
                    NextStep::Retry { at } => {
                        job.next_attempt_at = at;
                        self.store.reschedule(&mut job)?;
                        tracing::warn!("{kind} failed for {} (attempt {}), retrying at {at}: {message}", subscriber.id, job.attempts);
                        Ok(Outcome::Retried)
                    }
                    NextStep::Fallback { channel_index } => {
                        job.channel_index = channel_index;
                        job.attempts = 0;
                        job.next_attempt_at = now;
                        self.store.reschedule(&mut job)?;
                        tracing::warn!("{kind} failed for {}, falling back: {message}", subscriber.id);
                        Ok(Outcome::Fallback)
                    }
                    NextStep::GiveUp => {
                        self.store.mark_failed(&mut job, &message, now)?;
                        tracing::error!("❌ Delivery for {} on {} failed: {message}", subscriber.id, job.content_date);
                        Ok(Outcome::Failed)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted channels for dispatcher and engine tests.

    use async_trait::async_trait;
    use coachcast_core::error::{CoachcastError, Result};
    use coachcast_core::traits::DeliveryChannel;
    use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    pub enum Behavior {
        Ok,
        Transient,
        Permanent,
        RateLimited(u64),
    }

    pub struct MockChannel {
        kind: ChannelKind,
        script: Mutex<VecDeque<Behavior>>,
        pub sent: Mutex<Vec<Notification>>,
    }

    impl MockChannel {
        pub fn new(kind: ChannelKind, script: &[Behavior]) -> Self {
            Self { kind, script: Mutex::new(script.iter().copied().collect()), sent: Mutex::default() }
        }

        pub fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryChannel for MockChannel {
        fn kind(&self) -> ChannelKind { self.kind }

        fn name(&self) -> &str { "mock" }

        async fn deliver(&self, _subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
            self.sent.lock().unwrap().push(notification.clone());
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Behavior::Ok);
            match next {
                Behavior::Ok => Ok(DeliveryReceipt::with_id(format!("mock-{}", self.calls()))),
                Behavior::Transient => Err(CoachcastError::channel("503 upstream")),
                Behavior::Permanent => Err(CoachcastError::rejected("recipient blocked us")),
                Behavior::RateLimited(secs) => Err(CoachcastError::rate_limited("slow down", Some(secs))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{Behavior, MockChannel};
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use coachcast_core::config::RetryConfig;
    use coachcast_core::types::{ChannelKind, DailyContent, DeliveryStatus};

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    struct Harness {
        store: Arc<DeliveryStore>,
        dispatcher: Dispatcher,
    }

    fn harness(channels: Vec<Arc<MockChannel>>, max_attempts: u32) -> Harness {
        let store = Arc::new(DeliveryStore::open_in_memory().unwrap());
        let mut registry = ChannelRegistry::new();
        for channel in channels {
            registry.register(channel);
        }
        let retry = RetryPolicy::from_config(&RetryConfig {
            max_attempts_per_channel: max_attempts,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            jitter: 0.0,
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            AppConfig::default(),
            &SchedulerConfig::default(),
            retry,
            None,
            chrono_tz::UTC,
        );
        Harness { store, dispatcher }
    }

    fn seed(store: &DeliveryStore, channels: Vec<ChannelKind>, with_content: bool) -> DeliveryJob {
        let mut s = Subscriber::new("u1", "Ava Stone", "UTC", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        s.email = Some("ava@example.com".into());
        s.phone = Some("+15551234567".into());
        s.channels = channels;
        store.upsert_subscriber(&s).unwrap();
        if with_content {
            store.put_content(&DailyContent::new("u1", day(), "Momentum", "Start small.")).unwrap();
        }
        let job = DeliveryJob::new("u1", day(), utc(10, 7, 0));
        store.enqueue(&job).unwrap();
        job
    }

    #[tokio::test]
    async fn test_delivers_on_first_channel() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(email.calls(), 1);
        assert!(email.sent.lock().unwrap()[0].body.starts_with("Hi Ava"));

        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.channel, Some(ChannelKind::Email));
        assert_eq!(stored.provider_message_id.as_deref(), Some("mock-1"));
        let attempts = h.store.list_attempts(&job.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[Behavior::Transient]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_attempt_at, utc(10, 7, 1));
        assert!(stored.last_error.unwrap().contains("503"));

        // Not due yet.
        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().claimed, 0);

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 1)).await.unwrap();
        assert_eq!(report.delivered, 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_uses_provider_delay() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[Behavior::RateLimited(120)]));
        let h = harness(vec![email], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);

        h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.next_attempt_at, utc(10, 7, 2));
    }

    #[tokio::test]
    async fn test_permanent_failure_falls_back() {
        let sms = Arc::new(MockChannel::new(ChannelKind::Sms, &[Behavior::Permanent]));
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![sms.clone(), email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Sms, ChannelKind::Email], true);

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.fallbacks, 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.channel_index, 1);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.status, DeliveryStatus::Pending);

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sms.calls(), 1);
        assert_eq!(email.calls(), 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.channel, Some(ChannelKind::Email));
        assert_eq!(h.store.list_attempts(&job.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[Behavior::Transient, Behavior::Transient]));
        let h = harness(vec![email.clone()], 2);
        let job = seed(&h.store, vec![ChannelKind::Email], true);

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().retried, 1);
        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 8, 0)).await.unwrap().failed, 1);

        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.total_attempts, 2);
        assert_eq!(email.calls(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_channel_is_skipped() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Telegram, ChannelKind::Email], true);

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().delivered, 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.channel_index, 1);
    }

    #[tokio::test]
    async fn test_no_reachable_channel_fails() {
        let h = harness(vec![], 3);
        let job = seed(&h.store, vec![ChannelKind::Telegram], true);

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().failed, 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("no reachable channel"));
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_intrusive_channel() {
        let sms = Arc::new(MockChannel::new(ChannelKind::Sms, &[]));
        let h = harness(vec![sms.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Sms], true);
        let mut s = h.store.get_subscriber("u1").unwrap().unwrap();
        s.quiet_hours = QuietHours::parse_range("06:00-08:00");
        h.store.upsert_subscriber(&s).unwrap();

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(sms.calls(), 0);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.next_attempt_at, utc(10, 8, 0));
        assert_eq!(stored.attempts, 0);

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 8, 0)).await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_quiet_hours_ignored_for_email() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email], 3);
        seed(&h.store, vec![ChannelKind::Email], true);
        let mut s = h.store.get_subscriber("u1").unwrap().unwrap();
        s.quiet_hours = QuietHours::parse_range("06:00-08:00");
        h.store.upsert_subscriber(&s).unwrap();

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_missing_content_waits_then_fails() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], false);

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().deferred, 1);
        let stored = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.next_attempt_at, utc(10, 7, 5));

        // Past the two-hour wait.
        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 9, 30)).await.unwrap().failed, 1);
        assert_eq!(email.calls(), 0);
    }

    #[tokio::test]
    async fn test_paused_job_is_held_until_resume() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);
        h.store.set_paused_until("u1", Some(day())).unwrap();

        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap().deferred, 1);
        let held = h.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(held.status, DeliveryStatus::Pending);
        assert_eq!(held.next_attempt_at, utc(10, 7, 5));

        h.store.set_paused_until("u1", None).unwrap();
        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 7, 5)).await.unwrap().delivered, 1);
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn test_paused_past_lateness_is_cancelled() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email.clone()], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);
        h.store.set_paused_until("u1", Some(day())).unwrap();

        // Three hours after the scheduled 07:00.
        assert_eq!(h.dispatcher.dispatch_batch(utc(10, 10, 0)).await.unwrap().cancelled, 1);
        assert_eq!(h.store.get_job(&job.id).unwrap().unwrap().status, DeliveryStatus::Cancelled);
        assert_eq!(email.calls(), 0);
    }

    #[tokio::test]
    async fn test_inactive_or_missing_subscriber() {
        let email = Arc::new(MockChannel::new(ChannelKind::Email, &[]));
        let h = harness(vec![email], 3);
        let job = seed(&h.store, vec![ChannelKind::Email], true);
        h.store.set_active("u1", false).unwrap();

        let orphan = DeliveryJob::new("ghost", day(), utc(10, 7, 0));
        h.store.enqueue(&orphan).unwrap();

        let report = h.dispatcher.dispatch_batch(utc(10, 7, 0)).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(h.store.get_job(&job.id).unwrap().unwrap().status, DeliveryStatus::Cancelled);
        assert_eq!(h.store.get_job(&orphan.id).unwrap().unwrap().status, DeliveryStatus::Failed);
    }
}
