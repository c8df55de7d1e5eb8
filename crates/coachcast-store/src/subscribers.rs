//! Subscriber records and delivery preferences.

use chrono::{NaiveDate, Utc};
use coachcast_core::error::Result;
use coachcast_core::types::{ChannelKind, QuietHours, Subscriber};
use coachcast_core::types::subscriber::hhmm;
use rusqlite::{OptionalExtension, Row, params};

use crate::{DeliveryStore, conv, date_str, db_err, parse_date, parse_ts, ts};

const SUBSCRIBER_COLUMNS: &str = "id, name, email, phone, telegram_chat_id, push_token, timezone, \
     delivery_time, channels, quiet_start, quiet_end, active, paused_until, quiz, created_at, updated_at";

#[derive(Debug)]
struct BadTime(String);

impl std::fmt::Display for BadTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid time '{}'", self.0)
    }
}

impl std::error::Error for BadTime {}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<chrono::NaiveTime> {
    conv(idx, hhmm::parse(s).ok_or_else(|| BadTime(s.to_string())))
}

fn row_to_subscriber(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    let channels: String = row.get(8)?;
    let channels: Vec<ChannelKind> = conv(8, serde_json::from_str(&channels))?;
    let quiet_start: Option<String> = row.get(9)?;
    let quiet_end: Option<String> = row.get(10)?;
    let quiet_hours = match (quiet_start, quiet_end) {
        (Some(start), Some(end)) => Some(QuietHours::new(parse_time(9, &start)?, parse_time(10, &end)?)),
        _ => None,
    };
    let paused_until: Option<String> = row.get(12)?;
    let quiz: String = row.get(13)?;

    Ok(Subscriber {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        telegram_chat_id: row.get(4)?,
        push_token: row.get(5)?,
        timezone: row.get(6)?,
        delivery_time: parse_time(7, &row.get::<_, String>(7)?)?,
        channels,
        quiet_hours,
        active: row.get(11)?,
        paused_until: paused_until.map(|d| parse_date(12, &d)).transpose()?,
        quiz: serde_json::from_str(&quiz).unwrap_or_default(),
        created_at: parse_ts(14, &row.get::<_, String>(14)?)?,
        updated_at: parse_ts(15, &row.get::<_, String>(15)?)?,
    })
}

impl DeliveryStore {
    /// Insert or replace a subscriber, keeping the original `created_at`.
    pub fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let conn = self.lock()?;
        let channels = serde_json::to_string(&subscriber.channels)?;
        let quiz = subscriber.quiz.to_string();
        conn.execute(
            "INSERT INTO subscribers (id, name, email, phone, telegram_chat_id, push_token, timezone,
                delivery_time, channels, quiet_start, quiet_end, active, paused_until, quiz, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, email = excluded.email, phone = excluded.phone,
                telegram_chat_id = excluded.telegram_chat_id, push_token = excluded.push_token,
                timezone = excluded.timezone, delivery_time = excluded.delivery_time,
                channels = excluded.channels, quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end, active = excluded.active,
                paused_until = excluded.paused_until, quiz = excluded.quiz,
                updated_at = excluded.updated_at",
            params![
                subscriber.id,
                subscriber.name,
                subscriber.email,
                subscriber.phone,
                subscriber.telegram_chat_id,
                subscriber.push_token,
                subscriber.timezone,
                subscriber.delivery_time.format("%H:%M").to_string(),
                channels,
                subscriber.quiet_hours.map(|q| q.start.format("%H:%M").to_string()),
                subscriber.quiet_hours.map(|q| q.end.format("%H:%M").to_string()),
                subscriber.active,
                subscriber.paused_until.as_ref().map(date_str),
                quiz,
                ts(&subscriber.created_at),
                ts(&Utc::now()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_subscriber(&self, id: &str) -> Result<Option<Subscriber>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE id = ?1"),
            params![id],
            row_to_subscriber,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        self.query_subscribers(&format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers ORDER BY created_at"))
    }

    /// Subscribers the planner should consider.
    pub fn list_active_subscribers(&self) -> Result<Vec<Subscriber>> {
        self.query_subscribers(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE active = 1 ORDER BY created_at"
        ))
    }

    fn query_subscribers(&self, sql: &str) -> Result<Vec<Subscriber>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map([], row_to_subscriber).map_err(db_err)?;

        let mut subscribers = Vec::new();
        for row in rows {
            match row {
                Ok(s) => subscribers.push(s),
                Err(e) => tracing::warn!("Skipping unreadable subscriber row: {e}"),
            }
        }
        Ok(subscribers)
    }

    /// Returns false when the subscriber does not exist.
    pub fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        self.update_subscriber_field("active = ?2", id, &active)
    }

    pub fn set_paused_until(&self, id: &str, until: Option<NaiveDate>) -> Result<bool> {
        self.update_subscriber_field("paused_until = ?2", id, &until.as_ref().map(date_str))
    }

    pub fn set_telegram_chat_id(&self, id: &str, chat_id: &str) -> Result<bool> {
        self.update_subscriber_field("telegram_chat_id = ?2", id, &chat_id)
    }

    fn update_subscriber_field(&self, assignment: &str, id: &str, value: &dyn rusqlite::ToSql) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!("UPDATE subscribers SET {assignment}, updated_at = ?3 WHERE id = ?1"),
                params![id, value, ts(&Utc::now())],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Remove a subscriber and everything queued for them.
    pub fn delete_subscriber(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM delivery_queue WHERE subscriber_id = ?1 AND status IN ('pending', 'processing')",
            params![id],
        )
        .map_err(db_err)?;
        let changed = conn
            .execute("DELETE FROM subscribers WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::subscriber;

    #[test]
    fn test_upsert_and_get() {
        let store = DeliveryStore::open_in_memory().unwrap();
        let mut s = subscriber("u1");
        s.quiet_hours = QuietHours::parse_range("22:00-07:00");
        s.quiz = serde_json::json!({"goal": "sleep"});
        store.upsert_subscriber(&s).unwrap();

        let loaded = store.get_subscriber("u1").unwrap().unwrap();
        assert_eq!(loaded.email.as_deref(), Some("u1@example.com"));
        assert_eq!(loaded.channels, vec![ChannelKind::Email, ChannelKind::InApp]);
        assert_eq!(loaded.quiet_hours, s.quiet_hours);
        assert_eq!(loaded.delivery_time, s.delivery_time);
        assert_eq!(loaded.quiz["goal"], "sleep");
        assert!(store.get_subscriber("nobody").unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_existing() {
        let store = DeliveryStore::open_in_memory().unwrap();
        let mut s = subscriber("u1");
        store.upsert_subscriber(&s).unwrap();
        s.phone = Some("+15550002222".into());
        s.channels = vec![ChannelKind::Sms];
        store.upsert_subscriber(&s).unwrap();

        let all = store.list_subscribers().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].phone.as_deref(), Some("+15550002222"));
        assert_eq!(all[0].channels, vec![ChannelKind::Sms]);
    }

    #[test]
    fn test_active_and_pause_flags() {
        let store = DeliveryStore::open_in_memory().unwrap();
        store.upsert_subscriber(&subscriber("u1")).unwrap();
        store.upsert_subscriber(&subscriber("u2")).unwrap();

        assert!(store.set_active("u2", false).unwrap());
        assert!(!store.set_active("ghost", false).unwrap());
        let active = store.list_active_subscribers().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "u1");

        let until = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        store.set_paused_until("u1", Some(until)).unwrap();
        assert_eq!(store.get_subscriber("u1").unwrap().unwrap().paused_until, Some(until));
        store.set_paused_until("u1", None).unwrap();
        assert!(store.get_subscriber("u1").unwrap().unwrap().paused_until.is_none());
    }

    #[test]
    fn test_link_telegram_and_delete() {
        let store = DeliveryStore::open_in_memory().unwrap();
        store.upsert_subscriber(&subscriber("u1")).unwrap();
        assert!(store.set_telegram_chat_id("u1", "987654").unwrap());
        let s = store.get_subscriber("u1").unwrap().unwrap();
        assert_eq!(s.address_for(ChannelKind::Telegram), Some("987654"));

        assert!(store.delete_subscriber("u1").unwrap());
        assert!(!store.delete_subscriber("u1").unwrap());
    }
}
