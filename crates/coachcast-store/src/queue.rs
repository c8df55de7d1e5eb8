//! Delivery queue table and attempt log.
//!
//! Status transitions:
//!
//! ```text
//! pending ──claim_due──▶ processing ──mark_delivered──▶ delivered
//!    ▲                        │  └──────mark_failed────▶ failed ──retry_failed──▶ pending
//!    └──reschedule / release_stale┘
//! pending ──cancel──▶ cancelled
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};
use coachcast_core::error::Result;
use coachcast_core::types::{ChannelKind, DeliveryAttempt, DeliveryJob, DeliveryStatus, QueueStats};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::{DeliveryStore, conv, date_str, db_err, parse_date, parse_opt_ts, parse_ts, ts};

const JOB_COLUMNS: &str = "id, subscriber_id, content_date, status, channel_index, channel, attempts, \
     total_attempts, scheduled_for, next_attempt_at, claimed_at, last_error, provider_message_id, \
     delivered_at, created_at, updated_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<DeliveryJob> {
    let status: String = row.get(3)?;
    let channel: Option<String> = row.get(5)?;
    Ok(DeliveryJob {
        id: row.get(0)?,
        subscriber_id: row.get(1)?,
        content_date: parse_date(2, &row.get::<_, String>(2)?)?,
        status: conv(3, status.parse::<DeliveryStatus>())?,
        channel_index: row.get(4)?,
        channel: channel.map(|c| conv(5, c.parse::<ChannelKind>())).transpose()?,
        attempts: row.get(6)?,
        total_attempts: row.get(7)?,
        scheduled_for: parse_ts(8, &row.get::<_, String>(8)?)?,
        next_attempt_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        claimed_at: parse_opt_ts(10, row.get(10)?)?,
        last_error: row.get(11)?,
        provider_message_id: row.get(12)?,
        delivered_at: parse_opt_ts(13, row.get(13)?)?,
        created_at: parse_ts(14, &row.get::<_, String>(14)?)?,
        updated_at: parse_ts(15, &row.get::<_, String>(15)?)?,
    })
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<DeliveryAttempt> {
    let channel: String = row.get(2)?;
    Ok(DeliveryAttempt {
        id: row.get(0)?,
        job_id: row.get(1)?,
        channel: conv(2, channel.parse::<ChannelKind>())?,
        attempt: row.get(3)?,
        success: row.get(4)?,
        error: row.get(5)?,
        at: parse_ts(6, &row.get::<_, String>(6)?)?,
    })
}

/// Write back a claimed job. Applies only while the row is still in one of
/// `from`; a job cancelled mid-flight keeps its `cancelled` status.
fn write_job(conn: &Connection, job: &DeliveryJob, from: &[DeliveryStatus]) -> Result<bool> {
    let allowed = from.iter().map(|s| format!("'{}'", s.as_str())).collect::<Vec<_>>().join(", ");
    let changed = conn
        .execute(
            &format!(
                "UPDATE delivery_queue SET
                    status = ?2, channel_index = ?3, channel = ?4, attempts = ?5, total_attempts = ?6,
                    next_attempt_at = ?7, claimed_at = ?8, last_error = ?9, provider_message_id = ?10,
                    delivered_at = ?11, updated_at = ?12
                 WHERE id = ?1 AND status IN ({allowed})"
            ),
            params![
                job.id,
                job.status.as_str(),
                job.channel_index,
                job.channel.map(|c| c.as_str()),
                job.attempts,
                job.total_attempts,
                ts(&job.next_attempt_at),
                job.claimed_at.as_ref().map(ts),
                job.last_error,
                job.provider_message_id,
                job.delivered_at.as_ref().map(ts),
                ts(&job.updated_at),
            ],
        )
        .map_err(db_err)?;
    if changed == 0 {
        tracing::info!("Job {} changed while in flight, not writing {}", job.id, job.status);
    }
    Ok(changed == 1)
}

const CLAIMED: &[DeliveryStatus] = &[DeliveryStatus::Processing];
// A delivery that finishes after its claim went stale still counts.
const DELIVERABLE: &[DeliveryStatus] = &[DeliveryStatus::Processing, DeliveryStatus::Pending];

impl DeliveryStore {
    /// Add a job. Returns false when the subscriber already has a job for that date.
    pub fn enqueue(&self, job: &DeliveryJob) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                &format!("INSERT OR IGNORE INTO delivery_queue ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
                params![
                    job.id,
                    job.subscriber_id,
                    date_str(&job.content_date),
                    job.status.as_str(),
                    job.channel_index,
                    job.channel.map(|c| c.as_str()),
                    job.attempts,
                    job.total_attempts,
                    ts(&job.scheduled_for),
                    ts(&job.next_attempt_at),
                    job.claimed_at.as_ref().map(ts),
                    job.last_error,
                    job.provider_message_id,
                    job.delivered_at.as_ref().map(ts),
                    ts(&job.created_at),
                    ts(&job.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    /// Claim up to `limit` due pending jobs, flipping them to `processing`.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryJob>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now_s = ts(&now);

        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM delivery_queue
                     WHERE status = 'pending' AND next_attempt_at <= ?1
                     ORDER BY next_attempt_at, created_at LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now_s, limit as i64], |row| row.get(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let changed = tx
                .execute(
                    "UPDATE delivery_queue SET status = 'processing', claimed_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now_s],
                )
                .map_err(db_err)?;
            if changed == 1 {
                let job = tx
                    .query_row(
                        &format!("SELECT {JOB_COLUMNS} FROM delivery_queue WHERE id = ?1"),
                        params![id],
                        row_to_job,
                    )
                    .map_err(db_err)?;
                claimed.push(job);
            }
        }
        tx.commit().map_err(db_err)?;

        if !claimed.is_empty() {
            tracing::debug!("Claimed {} due delivery jobs", claimed.len());
        }
        Ok(claimed)
    }

    /// Return a claimed job to `pending` with its updated counters and next attempt time.
    /// Returns false when the job was cancelled while claimed.
    pub fn reschedule(&self, job: &mut DeliveryJob) -> Result<bool> {
        job.status = DeliveryStatus::Pending;
        job.claimed_at = None;
        job.updated_at = Utc::now();
        let conn = self.lock()?;
        write_job(&conn, job, CLAIMED)
    }

    pub fn mark_delivered(
        &self,
        job: &mut DeliveryJob,
        channel: ChannelKind,
        provider_message_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        job.status = DeliveryStatus::Delivered;
        job.channel = Some(channel);
        job.provider_message_id = provider_message_id;
        job.delivered_at = Some(at);
        job.claimed_at = None;
        job.updated_at = at;
        let conn = self.lock()?;
        write_job(&conn, job, DELIVERABLE)
    }

    pub fn mark_failed(&self, job: &mut DeliveryJob, error: &str, at: DateTime<Utc>) -> Result<bool> {
        job.status = DeliveryStatus::Failed;
        job.last_error = Some(error.to_string());
        job.claimed_at = None;
        job.updated_at = at;
        let conn = self.lock()?;
        write_job(&conn, job, CLAIMED)
    }

    pub fn mark_cancelled(&self, job: &mut DeliveryJob, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        job.status = DeliveryStatus::Cancelled;
        job.last_error = Some(reason.to_string());
        job.claimed_at = None;
        job.updated_at = at;
        let conn = self.lock()?;
        write_job(&conn, job, CLAIMED)
    }

    /// Cancel a pending or in-flight job. An in-flight delivery still runs,
    /// but its write-back no longer overrides the cancellation.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE delivery_queue SET status = 'cancelled', claimed_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![job_id, ts(&Utc::now())],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Put a failed job back in the queue from its first channel.
    ///
    /// Per-channel state is cleared. `total_attempts` keeps counting so the
    /// attempt log stays numbered across manual retries.
    pub fn retry_failed(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE delivery_queue SET status = 'pending', attempts = 0, channel_index = 0,
                    channel = NULL, last_error = NULL, provider_message_id = NULL,
                    next_attempt_at = ?2, claimed_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'",
                params![job_id, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Release claims older than `timeout`, left behind by a crashed worker.
    pub fn release_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<usize> {
        let cutoff = now - timeout;
        let conn = self.lock()?;
        let released = conn
            .execute(
                "UPDATE delivery_queue SET status = 'pending', claimed_at = NULL,
                    next_attempt_at = ?2, updated_at = ?2
                 WHERE status = 'processing' AND claimed_at < ?1",
                params![ts(&cutoff), ts(&now)],
            )
            .map_err(db_err)?;
        if released > 0 {
            tracing::warn!("Released {released} stale delivery claims");
        }
        Ok(released)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<DeliveryJob>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM delivery_queue WHERE id = ?1"),
            params![job_id],
            row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn find_job(&self, subscriber_id: &str, date: NaiveDate) -> Result<Option<DeliveryJob>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM delivery_queue WHERE subscriber_id = ?1 AND content_date = ?2"),
            params![subscriber_id, date_str(&date)],
            row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    /// Most recently touched jobs, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<DeliveryStatus>, limit: usize) -> Result<Vec<DeliveryJob>> {
        let conn = self.lock()?;
        let (sql, filter) = match status {
            Some(s) => (
                format!("SELECT {JOB_COLUMNS} FROM delivery_queue WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2"),
                s.as_str().to_string(),
            ),
            None => (
                format!("SELECT {JOB_COLUMNS} FROM delivery_queue WHERE ?1 = ?1 ORDER BY updated_at DESC LIMIT ?2"),
                String::new(),
            ),
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![filter, limit as i64], row_to_job)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM delivery_queue GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            let status: DeliveryStatus = status.parse()?;
            stats.add(status, count as u64);
        }
        Ok(stats)
    }

    /// Delete terminal jobs (and their attempt logs) last touched before `older_than`.
    pub fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = ts(&older_than);
        conn.execute(
            "DELETE FROM delivery_attempts WHERE job_id IN (
                SELECT id FROM delivery_queue
                WHERE status IN ('delivered', 'failed', 'cancelled') AND updated_at < ?1)",
            params![cutoff],
        )
        .map_err(db_err)?;
        let purged = conn
            .execute(
                "DELETE FROM delivery_queue
                 WHERE status IN ('delivered', 'failed', 'cancelled') AND updated_at < ?1",
                params![cutoff],
            )
            .map_err(db_err)?;
        Ok(purged)
    }

    pub fn record_attempt(
        &self,
        job_id: &str,
        channel: ChannelKind,
        attempt: u32,
        success: bool,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delivery_attempts (job_id, channel, attempt, success, error, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![job_id, channel.as_str(), attempt, success, error, ts(&at)],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_attempts(&self, job_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, channel, attempt, success, error, at
                 FROM delivery_attempts WHERE job_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map(params![job_id], row_to_attempt).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
