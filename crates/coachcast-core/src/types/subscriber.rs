//! Subscribers and their delivery preferences.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChannelKind;

/// `HH:MM` wall-clock times in config files and API payloads.
/// Seconds are accepted on input and dropped on output.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<NaiveTime> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid time '{raw}', expected HH:MM")))
    }
}

/// A local wall-clock window during which intrusive channels stay silent.
/// The window is half-open, `[start, end)`, and may wrap past midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `"22:00-07:00"`.
    pub fn parse_range(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('-')?;
        Some(Self::new(hhmm::parse(start)?, hhmm::parse(end)?))
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.wraps_midnight() {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }
}

impl std::fmt::Display for QuietHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// A subscriber of the daily coaching product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// E.164 phone number, shared by SMS and WhatsApp.
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    #[serde(with = "hhmm")]
    pub delivery_time: NaiveTime,
    /// Channels in order of preference; later entries are fallbacks.
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub paused_until: Option<NaiveDate>,
    /// Onboarding quiz answers, opaque to delivery.
    #[serde(default)]
    pub quiz: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool { true }

impl Subscriber {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        timezone: impl Into<String>,
        delivery_time: NaiveTime,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            phone: None,
            telegram_chat_id: None,
            push_token: None,
            timezone: timezone.into(),
            delivery_time,
            channels: vec![ChannelKind::InApp],
            quiet_hours: None,
            active: true,
            paused_until: None,
            quiz: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recipient address a channel needs for this subscriber, if known.
    pub fn address_for(&self, kind: ChannelKind) -> Option<&str> {
        let addr = match kind {
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::Sms | ChannelKind::Whatsapp => self.phone.as_deref(),
            ChannelKind::Telegram => self.telegram_chat_id.as_deref(),
            ChannelKind::Push => self.push_token.as_deref(),
            ChannelKind::InApp => Some(self.id.as_str()),
        };
        addr.filter(|a| !a.trim().is_empty())
    }

    /// Whether delivery for `date` is suspended by a pause.
    pub fn is_paused_on(&self, date: NaiveDate) -> bool {
        self.paused_until.is_some_and(|until| until >= date)
    }

    /// First name for greetings.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("there")
    }
}
