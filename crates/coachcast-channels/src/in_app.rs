//! In-app inbox: the notification lands in the local store for the web app to read.

use async_trait::async_trait;
use chrono::Utc;
use coachcast_core::error::Result;
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
use coachcast_store::DeliveryStore;
use std::sync::Arc;

pub struct InAppChannel {
    store: Arc<DeliveryStore>,
}

impl InAppChannel {
    pub fn new(store: Arc<DeliveryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::InApp }

    fn name(&self) -> &str { "inbox" }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let id = self.store.push_inbox(notification, Utc::now())?;
        tracing::debug!("Inbox item {id} for {}", subscriber.id);
        Ok(DeliveryReceipt::with_id(format!("inbox-{id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[tokio::test]
    async fn test_deliver_writes_inbox() {
        let store = Arc::new(DeliveryStore::open_in_memory().unwrap());
        let channel = InAppChannel::new(store.clone());
        let subscriber = Subscriber::new("u1", "Ana", "UTC", NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert!(channel.can_reach(&subscriber));

        let notification = Notification {
            subscriber_id: "u1".into(),
            title: "Coachcast: Focus".into(),
            body: "One thing at a time.".into(),
            audio_url: None,
            link: None,
        };
        let receipt = channel.deliver(&subscriber, &notification).await.unwrap();
        assert!(receipt.provider_message_id.unwrap().starts_with("inbox-"));

        let items = store.list_inbox("u1", true, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Coachcast: Focus");
    }
}
