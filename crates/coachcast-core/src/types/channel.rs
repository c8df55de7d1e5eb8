//! Delivery channel kinds and queue status.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CoachcastError;

/// A delivery channel, each backed by a distinct provider API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Whatsapp,
    Telegram,
    Sms,
    Push,
    #[serde(alias = "inapp")]
    InApp,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Email,
        ChannelKind::Whatsapp,
        ChannelKind::Telegram,
        ChannelKind::Sms,
        ChannelKind::Push,
        ChannelKind::InApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
            ChannelKind::InApp => "in_app",
        }
    }

    /// Channels that buzz a phone. Quiet hours only hold these back.
    pub fn is_intrusive(&self) -> bool {
        matches!(
            self,
            ChannelKind::Whatsapp | ChannelKind::Telegram | ChannelKind::Sms | ChannelKind::Push
        )
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = CoachcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "whatsapp" => Ok(ChannelKind::Whatsapp),
            "telegram" => Ok(ChannelKind::Telegram),
            "sms" => Ok(ChannelKind::Sms),
            "push" => Ok(ChannelKind::Push),
            "in_app" | "inapp" | "in-app" => Ok(ChannelKind::InApp),
            other => Err(CoachcastError::config(format!("Unknown channel: {other}"))),
        }
    }
}

/// Lifecycle of a delivery queue row.
///
/// `pending → processing → delivered | failed`, with `processing → pending`
/// on retry, deferral or stale-claim recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoachcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "processing" => Ok(DeliveryStatus::Processing),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "cancelled" => Ok(DeliveryStatus::Cancelled),
            other => Err(CoachcastError::store(format!("Unknown delivery status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display_and_parse() {
        for kind in ChannelKind::ALL {
            let parsed: ChannelKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!("In-App".parse::<ChannelKind>().unwrap(), ChannelKind::InApp);
        assert!("pigeon".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_channel_serde_names() {
        assert_eq!(serde_json::to_string(&ChannelKind::InApp).unwrap(), "\"in_app\"");
        let kind: ChannelKind = serde_json::from_str("\"inapp\"").unwrap();
        assert_eq!(kind, ChannelKind::InApp);
    }

    #[test]
    fn test_intrusive_channels() {
        assert!(ChannelKind::Sms.is_intrusive());
        assert!(ChannelKind::Push.is_intrusive());
        assert!(!ChannelKind::Email.is_intrusive());
        assert!(!ChannelKind::InApp.is_intrusive());
    }

    #[test]
    fn test_terminal_status() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Processing.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert_eq!("cancelled".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Cancelled);
    }
}
