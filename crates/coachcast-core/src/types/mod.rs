//! Domain types shared across crates.

pub mod channel;
pub mod delivery;
pub mod subscriber;

pub use channel::{ChannelKind, DeliveryStatus};
pub use delivery::{
    DailyContent, DeliveryAttempt, DeliveryJob, DeliveryReceipt, InboxItem, Notification,
    QueueStats,
};
pub use subscriber::{QuietHours, Subscriber};
