//! # Vigil Channels
//! Delivery channel implementations: APNs push, SMTP email, SMS stub.

pub mod email;
pub mod push;
pub mod sms;

use std::sync::Arc;

use vigil_core::config::VigilConfig;
use vigil_core::traits::NotificationChannel;

pub use email::EmailChannel;
pub use push::ApnsChannel;
pub use sms::SmsChannel;

/// One sender per channel tag. Unconfigured senders are still returned so
/// their sends fail permanently instead of finding no channel at all.
///
/// Call from within a Tokio runtime (see [`EmailChannel::new`]).
pub fn build_channels(config: &VigilConfig) -> Vec<Arc<dyn NotificationChannel>> {
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(ApnsChannel::new(config.push.clone())),
        Arc::new(EmailChannel::new(config.email.clone())),
        Arc::new(SmsChannel),
    ];
    for ch in &channels {
        if ch.is_available() {
            tracing::info!("✅ Channel ready: {}", ch.channel());
        } else {
            tracing::warn!("⚠️ Channel not configured: {}", ch.channel());
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::Channel;

    #[test]
    fn test_build_channels_covers_every_tag() {
        let channels = build_channels(&VigilConfig::default());
        let tags: Vec<Channel> = channels.iter().map(|c| c.channel()).collect();
        assert_eq!(tags, vec![Channel::Push, Channel::Email, Channel::Sms]);
        assert!(channels.iter().all(|c| !c.is_available()));
    }

    #[tokio::test]
    async fn test_build_channels_with_smtp_configured() {
        let mut config = VigilConfig::default();
        config.email.smtp_host = "smtp.example.com".into();
        config.email.from_email = "alerts@example.com".into();
        let channels = build_channels(&config);
        let email = channels.iter().find(|c| c.channel() == Channel::Email).unwrap();
        assert!(email.is_available());
    }
}
