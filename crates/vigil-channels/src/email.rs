//! Email channel: SMTP sending via async lettre.
//!
//! Used for emergency-contact alerts. Plain-text bodies; the `data` map of a
//! notification has no place in a mail and is ignored.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use serde_json::{Map, Value};
use vigil_core::config::EmailConfig;
use vigil_core::error::{SendError, VigilError};
use vigil_core::traits::NotificationChannel;
use vigil_core::types::Channel;

/// SMTP sender.
pub struct EmailChannel {
    config: EmailConfig,
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailChannel {
    /// Must be called inside a Tokio runtime: a complete config builds
    /// lettre's pooled transport, which spawns its pool task immediately.
    pub fn new(config: EmailConfig) -> Self {
        let mailer = if config.is_complete() {
            build_mailer(&config)
        } else {
            None
        };
        Self { config, mailer }
    }

    fn from_mailbox(&self) -> Result<Mailbox, SendError> {
        format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| SendError::permanent(format!("Invalid from: {e}")))
    }
}

fn build_mailer(config: &EmailConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    // 465 is implicit TLS; everything else upgrades with STARTTLS.
    let builder = if config.smtp_port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
    };
    let builder = match builder {
        Ok(b) => b.port(config.smtp_port),
        Err(e) => {
            tracing::warn!("⚠️ SMTP relay {} unusable: {e}", config.smtp_host);
            return None;
        }
    };
    let builder = if config.smtp_user.is_empty() {
        builder
    } else {
        builder.credentials(Credentials::new(
            config.smtp_user.clone(),
            config.smtp_password.clone(),
        ))
    };
    Some(builder.build())
}

/// Parse a recipient address; anything unparsable is a permanent failure.
pub fn parse_recipient(to: &str) -> Result<Mailbox, SendError> {
    let to = to.trim();
    if to.is_empty() {
        return Err(SendError::permanent("empty recipient address"));
    }
    to.parse()
        .map_err(|e| SendError::permanent(format!("Invalid to '{to}': {e}")))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn is_available(&self) -> bool {
        self.mailer.is_some()
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        _data: &Map<String, Value>,
    ) -> Result<(), SendError> {
        let to_mailbox = parse_recipient(recipient)?;
        let Some(mailer) = &self.mailer else {
            return Err(VigilError::ChannelUnconfigured("email".into()).into());
        };

        let email = LettreMessage::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| SendError::permanent(format!("Build email: {e}")))?;

        match mailer.send(email).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to: {}", recipient.trim());
                Ok(())
            }
            // 5xx replies: mailbox unknown, relay denied, ...
            Err(e) if e.is_permanent() => Err(SendError::permanent(format!("SMTP send: {e}"))),
            Err(e) => Err(SendError::retryable(format!("SMTP send: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_user: "alerts@example.com".into(),
            smtp_password: "secret".into(),
            from_email: "alerts@example.com".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_recipient() {
        assert!(parse_recipient("a@example.com").is_ok());
        assert!(!parse_recipient("   ").unwrap_err().retryable);
        assert!(!parse_recipient("not an address").unwrap_err().retryable);
    }

    #[tokio::test]
    async fn test_availability_follows_config() {
        assert!(!EmailChannel::new(EmailConfig::default()).is_available());
        let ch = EmailChannel::new(configured());
        assert!(ch.is_available());
        assert_eq!(ch.channel(), Channel::Email);
        assert!(ch.from_mailbox().is_ok());
    }

    #[tokio::test]
    async fn test_empty_recipient_is_permanent() {
        let ch = EmailChannel::new(configured());
        let err = ch.send("", "s", "b", &Map::new()).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_unconfigured_send_is_permanent() {
        let ch = EmailChannel::new(EmailConfig::default());
        let err = ch.send("a@example.com", "s", "b", &Map::new()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("not configured"));
    }
}
