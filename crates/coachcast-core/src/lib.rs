//! # Coachcast Core
//! Shared error type, configuration, domain types and channel trait.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CoachcastConfig;
pub use error::{CoachcastError, Result};
