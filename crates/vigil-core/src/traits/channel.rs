//! Delivery channel capability.

use async_trait::async_trait;

use crate::error::SendError;
use crate::types::Channel;

/// A sender for one delivery medium.
///
/// Implementations report failures as `SendError` values; they never touch
/// the notification store.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// The channel tag this sender serves.
    fn channel(&self) -> Channel;

    /// Whether credentials/transport are configured. An unavailable sender
    /// must still answer `send` with a permanent error.
    fn is_available(&self) -> bool {
        true
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SendError>;
}
