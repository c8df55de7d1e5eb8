//! Daily content, queue rows, and rendered notifications.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{ChannelKind, DeliveryStatus};

/// A generated script plus synthesized audio, assigned to a subscriber for a date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyContent {
    pub id: String,
    pub subscriber_id: String,
    pub date: NaiveDate,
    pub title: String,
    pub script: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DailyContent {
    pub fn new(
        subscriber_id: impl Into<String>,
        date: NaiveDate,
        title: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_id: subscriber_id.into(),
            date,
            title: title.into(),
            script: script.into(),
            audio_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_audio(mut self, url: impl Into<String>) -> Self {
        self.audio_url = Some(url.into());
        self
    }
}

/// One row of the delivery queue: "deliver `content_date` to `subscriber_id`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: String,
    pub subscriber_id: String,
    pub content_date: NaiveDate,
    pub status: DeliveryStatus,
    /// Index into the subscriber's channel preference list.
    pub channel_index: u32,
    /// Channel of the most recent attempt.
    pub channel: Option<ChannelKind>,
    /// Attempts made on the current channel.
    pub attempts: u32,
    pub total_attempts: u32,
    /// Local delivery time converted to UTC.
    pub scheduled_for: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(subscriber_id: impl Into<String>, content_date: NaiveDate, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_id: subscriber_id.into(),
            content_date,
            status: DeliveryStatus::Pending,
            channel_index: 0,
            channel: None,
            attempts: 0,
            total_attempts: 0,
            scheduled_for,
            next_attempt_at: scheduled_for,
            claimed_at: None,
            last_error: None,
            provider_message_id: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Log entry for a single send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub job_id: String,
    pub channel: ChannelKind,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Channel-neutral message rendered from daily content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subscriber_id: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// What a provider told us after accepting a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { provider_message_id: Some(id.into()) }
    }
}

/// In-app notification shown in the content library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: i64,
    pub subscriber_id: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub audio_url: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Row counts per queue status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.delivered + self.failed + self.cancelled
    }

    pub fn add(&mut self, status: DeliveryStatus, count: u64) {
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Processing => self.processing += count,
            DeliveryStatus::Delivered => self.delivered += count,
            DeliveryStatus::Failed => self.failed += count,
            DeliveryStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending_and_due_at_schedule() {
        let at = Utc::now();
        let date = at.date_naive();
        let job = DeliveryJob::new("u1", date, at);
        assert_eq!(job.status, DeliveryStatus::Pending);
        assert_eq!(job.next_attempt_at, job.scheduled_for);
        assert_eq!(job.attempts, 0);
        assert!(job.channel.is_none());
    }

    #[test]
    fn test_queue_stats() {
        let mut stats = QueueStats::default();
        stats.add(DeliveryStatus::Pending, 3);
        stats.add(DeliveryStatus::Delivered, 5);
        stats.add(DeliveryStatus::Failed, 1);
        assert_eq!(stats.total(), 9);
        assert_eq!(stats.pending, 3);
    }

    #[test]
    fn test_notification_skips_empty_fields() {
        let n = Notification {
            subscriber_id: "u1".into(),
            title: "Day 3".into(),
            body: "Breathe.".into(),
            audio_url: None,
            link: None,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("audio_url").is_none());
        assert_eq!(json["title"], "Day 3");
    }
}
