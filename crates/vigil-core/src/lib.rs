//! # Vigil Core
//!
//! Shared vocabulary for the check-in watchdog: the notification data model,
//! the error taxonomy, configuration, and the capability traits that the
//! delivery channels and the user/check-in collaborator implement.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::VigilConfig;
pub use error::{Result, SendError, VigilError};
pub use traits::{NotificationChannel, UserDirectory};
pub use types::{
    Channel, NewOccurrence, Notification, NotificationContent, NotificationStatus, UserProfile,
};
