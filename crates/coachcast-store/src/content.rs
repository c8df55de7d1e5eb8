//! Daily content: the generated script and audio for a subscriber and date.

use chrono::NaiveDate;
use coachcast_core::error::Result;
use coachcast_core::types::DailyContent;
use rusqlite::{OptionalExtension, Row, params};

use crate::{DeliveryStore, date_str, db_err, parse_date, parse_ts, ts};

fn row_to_content(row: &Row<'_>) -> rusqlite::Result<DailyContent> {
    Ok(DailyContent {
        id: row.get(0)?,
        subscriber_id: row.get(1)?,
        date: parse_date(2, &row.get::<_, String>(2)?)?,
        title: row.get(3)?,
        script: row.get(4)?,
        audio_url: row.get(5)?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
    })
}

impl DeliveryStore {
    /// Store content for a date, replacing any earlier version.
    pub fn put_content(&self, content: &DailyContent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO daily_content (id, subscriber_id, date, title, script, audio_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(subscriber_id, date) DO UPDATE SET
                title = excluded.title, script = excluded.script, audio_url = excluded.audio_url",
            params![
                content.id,
                content.subscriber_id,
                date_str(&content.date),
                content.title,
                content.script,
                content.audio_url,
                ts(&content.created_at),
            ],
        )
        .map_err(db_err)?;
        tracing::debug!("Content stored for {} on {}", content.subscriber_id, content.date);
        Ok(())
    }

    pub fn get_content(&self, subscriber_id: &str, date: NaiveDate) -> Result<Option<DailyContent>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, subscriber_id, date, title, script, audio_url, created_at
             FROM daily_content WHERE subscriber_id = ?1 AND date = ?2",
            params![subscriber_id, date_str(&date)],
            row_to_content,
        )
        .optional()
        .map_err(db_err)
    }

    /// Content library, newest first.
    pub fn list_content(&self, subscriber_id: &str, limit: usize) -> Result<Vec<DailyContent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subscriber_id, date, title, script, audio_url, created_at
                 FROM daily_content WHERE subscriber_id = ?1 ORDER BY date DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![subscriber_id, limit as i64], row_to_content)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
