//! # Coachcast Channels
//!
//! Provider integrations behind the `DeliveryChannel` trait.
//!
//! ```text
//! ChannelRegistry (built from [channels] config)
//!   ├── email     → Resend | SendGrid | SMTP
//!   ├── sms       → Twilio Messages API
//!   ├── whatsapp  → Twilio Messages API (whatsapp: sender)
//!   ├── telegram  → Bot API sendMessage + sendAudio
//!   ├── push      → push relay (holds VAPID keys)
//!   └── in_app    → local inbox table
//! ```

pub mod email;
mod http;
pub mod in_app;
pub mod push;
pub mod render;
pub mod telegram;
pub mod twilio;

pub use email::EmailChannel;
pub use in_app::InAppChannel;
pub use push::PushChannel;
pub use render::render_notification;
pub use telegram::{LinkRequest, TelegramChannel, parse_link_update};
pub use twilio::{SmsChannel, TwilioClient, WhatsAppChannel};

use coachcast_core::config::ChannelsConfig;
use coachcast_core::error::Result;
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::ChannelKind;
use coachcast_store::DeliveryStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Configured channels, keyed by kind. At most one provider per kind.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one of the same kind.
    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        tracing::info!("📡 Channel registered: {} ({})", channel.kind(), channel.name());
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn DeliveryChannel>> {
        self.channels.get(&kind).cloned()
    }

    pub fn is_configured(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    /// Registered kinds in canonical order.
    pub fn kinds(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .iter()
            .copied()
            .filter(|k| self.channels.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Build every enabled channel from config.
    pub fn from_config(config: &ChannelsConfig, store: Arc<DeliveryStore>) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(email) = config.email.as_ref().filter(|c| c.enabled) {
            registry.register(Arc::new(EmailChannel::new(email.clone())?));
        }

        if let Some(twilio) = config.twilio.as_ref().filter(|c| c.enabled) {
            let client = Arc::new(TwilioClient::new(twilio));
            if let Some(from) = &twilio.sms_from {
                registry.register(Arc::new(SmsChannel::new(client.clone(), from.clone())));
            }
            if let Some(from) = &twilio.whatsapp_from {
                registry.register(Arc::new(WhatsAppChannel::new(client, from.clone())));
            }
        }

        if let Some(telegram) = config.telegram.as_ref().filter(|c| c.enabled && !c.bot_token.is_empty()) {
            registry.register(Arc::new(TelegramChannel::new(telegram.clone())));
        }

        if let Some(push) = config.push.as_ref().filter(|c| c.enabled) {
            registry.register(Arc::new(PushChannel::new(push.clone())));
        }

        if config.in_app.enabled {
            registry.register(Arc::new(InAppChannel::new(store)));
        }

        Ok(registry)
    }
}
