//! In-app inbox, the sink of the in-app delivery channel.

use chrono::{DateTime, Utc};
use coachcast_core::error::Result;
use coachcast_core::types::{InboxItem, Notification};
use rusqlite::{Row, params};

use crate::{DeliveryStore, db_err, parse_ts, ts};

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<InboxItem> {
    Ok(InboxItem {
        id: row.get(0)?,
        subscriber_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        link: row.get(4)?,
        audio_url: row.get(5)?,
        read: row.get(6)?,
        created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
    })
}

impl DeliveryStore {
    pub fn push_inbox(&self, notification: &Notification, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO inbox (subscriber_id, title, body, link, audio_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                notification.subscriber_id,
                notification.title,
                notification.body,
                notification.link,
                notification.audio_url,
                ts(&at),
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_inbox(&self, subscriber_id: &str, unread_only: bool, limit: usize) -> Result<Vec<InboxItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subscriber_id, title, body, link, audio_url, read, created_at
                 FROM inbox WHERE subscriber_id = ?1 AND (?2 = 0 OR read = 0)
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![subscriber_id, unread_only, limit as i64], row_to_item)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Returns false when the item does not exist.
    pub fn mark_read(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("UPDATE inbox SET read = 1 WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn unread_count(&self, subscriber_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM inbox WHERE subscriber_id = ?1 AND read = 0",
                params![subscriber_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }
}
