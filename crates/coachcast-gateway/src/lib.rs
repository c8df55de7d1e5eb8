//! # Coachcast Gateway
//! HTTP API over the delivery store and scheduler, plus the Telegram bot webhook.

pub mod error;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, build_router, start};
