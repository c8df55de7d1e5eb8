//! # Coachcast Scheduler
//!
//! Timezone-aware daily delivery on top of the SQLite queue.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval)
//!   └── tick(now)
//!         ├── release_stale      processing → pending after a crash
//!         ├── Planner::plan      subscriber-days due in their local time
//!         │     └── enqueue      UNIQUE(subscriber, date) keeps it idempotent
//!         └── Dispatcher         claim_due → render → channel.deliver
//!               ├── quiet hours  intrusive channels wait for the window end
//!               └── RetryPolicy  backoff on the same channel, then fall back
//! ```

pub mod dispatcher;
pub mod engine;
pub mod planner;
pub mod quiet;
pub mod retry;
pub mod timezone;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use engine::{SchedulerEngine, TickReport};
pub use planner::Planner;
pub use retry::{NextStep, RetryPolicy};
