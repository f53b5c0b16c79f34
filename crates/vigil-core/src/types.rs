//! Notification data model and the read-only user view consumed from the
//! user-management collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VigilError;

/// Retry budget given to occurrences unless the caller overrides it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Emergency contacts beyond this count are ignored.
pub const MAX_EMERGENCY_CONTACTS: usize = 3;

/// Delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Channel::Push),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(VigilError::InvalidInput(format!("unknown channel '{other}'"))),
        }
    }
}

/// Lifecycle of one occurrence.
///
/// ```text
/// pending ──► sending ──► sent
///                │  ▲
///                │  └──── retrying
///                ├──────► retrying
///                └──────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Retrying,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }

    /// States a dispatcher may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, NotificationStatus::Pending | NotificationStatus::Retrying)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "retrying" => Ok(NotificationStatus::Retrying),
            other => Err(VigilError::InvalidInput(format!(
                "unknown notification status '{other}'"
            ))),
        }
    }
}

/// What gets delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub subject: String,
    pub body: String,
    /// Extra key/value payload (merged into push payloads).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl NotificationContent {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// A durable notification occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    /// Deduplication token: `{user_id}_{channel}_{date}[_{recipient}]`.
    pub unique_key: String,
    pub user_id: String,
    pub channel: Channel,
    /// Device token or email address.
    pub recipient: String,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest instant eligible for dispatch.
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub content: NotificationContent,
    /// Timezone the occurrence was computed under (informational).
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Arguments of `CreateOccurrence`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOccurrence {
    pub user_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub timezone: String,
    pub scheduled_at: DateTime<Utc>,
    pub content: NotificationContent,
    pub unique_key: String,
    pub max_retries: u32,
}

impl NewOccurrence {
    pub fn new(
        user_id: &str,
        channel: Channel,
        recipient: &str,
        timezone: &str,
        scheduled_at: DateTime<Utc>,
        content: NotificationContent,
        unique_key: String,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            channel,
            recipient: recipient.to_string(),
            timezone: timezone.to_string(),
            scheduled_at,
            content,
            unique_key,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Build a deduplication key. `date` is `yyyy-mm-dd` in the user's timezone.
pub fn occurrence_key(user_id: &str, channel: Channel, date: &str, recipient: Option<&str>) -> String {
    match recipient {
        Some(r) => format!("{user_id}_{channel}_{date}_{r}"),
        None => format!("{user_id}_{channel}_{date}"),
    }
}

/// Read-only view of a user, as supplied by the user-management collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub push_enabled: bool,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub emergency_contacts: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl UserProfile {
    /// The registered device token, if any (blank tokens count as absent).
    pub fn device_token(&self) -> Option<&str> {
        self.push_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Usable emergency contact addresses, capped at `MAX_EMERGENCY_CONTACTS`.
    pub fn contact_emails(&self) -> Vec<&str> {
        self.emergency_contacts
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .take(MAX_EMERGENCY_CONTACTS)
            .collect()
    }

    /// Name used in messages sent about this user.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occurrence_key_format() {
        assert_eq!(
            occurrence_key("U1", Channel::Push, "2024-01-01", None),
            "U1_push_2024-01-01"
        );
        assert_eq!(
            occurrence_key("U1", Channel::Email, "2024-01-01", Some("a@b.c")),
            "U1_email_2024-01-01_a@b.c"
        );
    }

    #[test]
    fn test_status_roundtrip_and_terminal() {
        for s in ["pending", "sending", "sent", "failed", "retrying"] {
            let status: NotificationStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!(NotificationStatus::Sent.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
        assert!(!NotificationStatus::Retrying.is_terminal());
        assert!(NotificationStatus::Retrying.is_claimable());
        assert!(!NotificationStatus::Sending.is_claimable());
    }

    #[test]
    fn test_unknown_channel_rejected() {
        assert!(matches!("fax".parse::<Channel>(), Err(VigilError::InvalidInput(_))));
        assert!(matches!(
            "queued".parse::<NotificationStatus>(),
            Err(VigilError::InvalidInput(_))
        ));
        assert_eq!("sms".parse::<Channel>().unwrap(), Channel::Sms);
    }

    #[test]
    fn test_contact_emails_capped_and_trimmed() {
        let user = UserProfile {
            id: "U1".into(),
            emergency_contacts: vec![
                " a@x.com ".into(),
                "".into(),
                "b@x.com".into(),
                "c@x.com".into(),
                "d@x.com".into(),
            ],
            ..Default::default()
        };
        assert_eq!(user.contact_emails(), vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_blank_token_is_absent() {
        let mut user = UserProfile {
            id: "U1".into(),
            push_token: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(user.device_token(), None);
        user.push_token = Some("tok1".into());
        assert_eq!(user.device_token(), Some("tok1"));
        assert_eq!(user.display_name(), "U1");
    }
}
