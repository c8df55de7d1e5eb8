//! Scheduler engine: the polling loop that plans, enqueues and dispatches.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use coachcast_channels::ChannelRegistry;
use coachcast_core::config::CoachcastConfig;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_store::DeliveryStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::planner::Planner;
use crate::retry::RetryPolicy;
use crate::timezone::parse_timezone;

/// What one tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    /// Another tick was still running.
    pub skipped: bool,
    pub released: usize,
    pub planned: usize,
    pub enqueued: usize,
    pub purged: usize,
    pub dispatch: DispatchReport,
}

impl TickReport {
    fn skipped(at: DateTime<Utc>) -> Self {
        Self {
            at,
            skipped: true,
            released: 0,
            planned: 0,
            enqueued: 0,
            purged: 0,
            dispatch: DispatchReport::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.released == 0 && self.enqueued == 0 && self.purged == 0 && self.dispatch.claimed == 0
    }
}

pub struct SchedulerEngine {
    store: Arc<DeliveryStore>,
    planner: Planner,
    dispatcher: Dispatcher,
    tick_interval: std::time::Duration,
    processing_timeout: Duration,
    purge_after: Duration,
    tick_lock: Mutex<()>,
    last_purge: std::sync::Mutex<Option<NaiveDate>>,
}

impl SchedulerEngine {
    pub fn new(config: &CoachcastConfig, store: Arc<DeliveryStore>, channels: Arc<ChannelRegistry>) -> Result<Self> {
        config.validate()?;
        let default_tz = parse_timezone(&config.app.default_timezone)?;
        let scheduler = &config.scheduler;
        let dispatcher = Dispatcher::new(
            store.clone(),
            channels,
            config.app.clone(),
            scheduler,
            RetryPolicy::from_config(&config.retry),
            config.quiet_hours,
            default_tz,
        );
        Ok(Self {
            store,
            planner: Planner::new(scheduler, default_tz),
            dispatcher,
            tick_interval: std::time::Duration::from_secs(scheduler.tick_interval_secs.max(1)),
            processing_timeout: Duration::seconds(scheduler.processing_timeout_secs as i64),
            purge_after: Duration::days(scheduler.purge_after_days as i64),
            tick_lock: Mutex::new(()),
            last_purge: std::sync::Mutex::new(None),
        })
    }

    /// One scheduling cycle: recover stale claims, enqueue due days, dispatch a batch.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            tracing::debug!("Tick skipped: previous tick still running");
            return Ok(TickReport::skipped(now));
        };

        let released = self.store.release_stale(now, self.processing_timeout)?;

        let subscribers = self.store.list_active_subscribers()?;
        let jobs = self.planner.plan(&subscribers, now);
        let mut enqueued = 0;
        for job in &jobs {
            if self.store.enqueue(job)? {
                enqueued += 1;
                tracing::info!("📅 Queued {} for {} at {}", job.content_date, job.subscriber_id, job.scheduled_for);
            }
        }

        let dispatch = self.dispatcher.dispatch_batch(now).await?;
        let purged = self.purge_daily(now)?;

        Ok(TickReport {
            at: now,
            skipped: false,
            released,
            planned: jobs.len(),
            enqueued,
            purged,
            dispatch,
        })
    }

    /// Drop terminal rows older than the retention window, at most once per UTC day.
    /// A failed purge is retried on the next tick.
    fn purge_daily(&self, now: DateTime<Utc>) -> Result<usize> {
        let today = now.date_naive();
        let mut last = self
            .last_purge
            .lock()
            .map_err(|e| CoachcastError::Other(format!("purge lock poisoned: {e}")))?;
        if *last == Some(today) {
            return Ok(0);
        }
        let purged = self.purge(now)?;
        *last = Some(today);
        if purged > 0 {
            tracing::info!("🧹 Purged {purged} finished deliveries");
        }
        Ok(purged)
    }

    pub fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            .checked_sub_signed(self.purge_after)
            .ok_or_else(|| CoachcastError::config(format!("purge cutoff before {now} is out of range")))?;
        self.store.purge_finished(cutoff)
    }

    /// Tick on an interval until `shutdown` flips to true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("⏰ Scheduler started (tick every {}s)", self.tick_interval.as_secs());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_idle() => tracing::info!(
                            "Tick: +{} queued, {} delivered, {} retried, {} failed",
                            report.enqueued,
                            report.dispatch.delivered,
                            report.dispatch.retried,
                            report.dispatch.failed
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!("Scheduler tick failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
