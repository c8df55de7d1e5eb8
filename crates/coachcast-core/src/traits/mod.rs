//! Trait seams between the scheduler and its collaborators.

pub mod channel;

pub use channel::DeliveryChannel;
