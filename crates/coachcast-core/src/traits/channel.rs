//! Delivery channel trait: every provider integration implements this.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};

/// An outbound delivery channel (email, SMS, Telegram, ...).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Human-readable provider name, e.g. `twilio-sms`.
    fn name(&self) -> &str;

    /// Whether the subscriber has what this channel needs (address, token).
    fn can_reach(&self, subscriber: &Subscriber) -> bool {
        subscriber.address_for(self.kind()).is_some()
    }

    /// Hand the notification to the provider.
    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt>;
}
