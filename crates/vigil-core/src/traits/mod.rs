//! Capability traits implemented outside the core.

pub mod channel;
pub mod directory;

pub use channel::NotificationChannel;
pub use directory::UserDirectory;
