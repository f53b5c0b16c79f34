//! SMS channel placeholder. No provider is wired up; every send fails permanently.

use async_trait::async_trait;
use serde_json::{Map, Value};
use vigil_core::error::SendError;
use vigil_core::traits::NotificationChannel;
use vigil_core::types::Channel;

#[derive(Debug, Default)]
pub struct SmsChannel;

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn send(
        &self,
        _recipient: &str,
        _subject: &str,
        _body: &str,
        _data: &Map<String, Value>,
    ) -> Result<(), SendError> {
        Err(SendError::permanent("sms not implemented"))
    }
}
