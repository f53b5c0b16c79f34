//! # Vigil Scheduler
//!
//! Durable notification pipeline for the check-in watchdog.
//!
//! ## Design Principles
//! - SQLite persistence: every occurrence survives restarts, nothing is deleted
//! - Claims are conditional updates, so several dispatchers may share a store
//! - Tokio timers only, idle between polls
//! - Time comes from an injected [`Clock`]
//!
//! ## Architecture
//! ```text
//! Driver (tokio interval ×2)
//!   ├── OccasionScheduler (hourly)
//!   │     ├── daily push reminder   → pending rows
//!   │     └── missed check-in email → pending rows (one per contact)
//!   └── Dispatcher (every minute)
//!         ├── claim pending / retrying (oldest first, batch limit)
//!         ├── ChannelRegistry → push | email | sms
//!         └── sent | retrying (1m, 5m, 30m) | failed
//! ```

pub mod clock;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod occasions;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::SqliteUserDirectory;
pub use dispatch::{ChannelRegistry, DispatchReport, Dispatcher, backoff};
pub use engine::{Driver, DriverConfig};
pub use occasions::{OccasionRules, OccasionScheduler, SchedulingReport};
pub use store::NotificationStore;
