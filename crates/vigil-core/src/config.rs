//! Vigil configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VigilError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl VigilConfig {
    /// Load config from the default path (~/.vigil/config.toml), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| VigilError::Config(format!("Failed to parse config: {e}")))
    }

    /// Overlay deployment variables (`APNS_*`, `SMTP_*`, `FROM_*`, `VIGIL_DB_PATH`).
    /// Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("VIGIL_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = get("APNS_KEY_ID") {
            self.push.key_id = v;
        }
        if let Some(v) = get("APNS_TEAM_ID") {
            self.push.team_id = v;
        }
        if let Some(v) = get("APNS_BUNDLE_ID") {
            self.push.bundle_id = v;
        }
        if let Some(v) = get("APNS_KEY_PATH") {
            self.push.key_path = v;
        }
        if let Some(v) = get("APNS_PRODUCTION") {
            self.push.production = v == "true";
        }
        if let Some(v) = get("SMTP_HOST") {
            self.email.smtp_host = v;
        }
        if let Some(v) = get("SMTP_PORT") {
            match v.parse() {
                Ok(port) => self.email.smtp_port = port,
                Err(_) => tracing::warn!("⚠️ Ignoring invalid SMTP_PORT '{v}'"),
            }
        }
        if let Some(v) = get("SMTP_USER") {
            self.email.smtp_user = v;
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.email.smtp_password = v;
        }
        if let Some(v) = get("FROM_EMAIL") {
            self.email.from_email = v;
        }
        if let Some(v) = get("FROM_NAME") {
            self.email.from_name = v;
        }
    }

    /// Reject settings the scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.reminder_hour > 23 || s.reminder_minute > 59 {
            return Err(VigilError::Config(format!(
                "reminder time {:02}:{:02} is not a valid time of day",
                s.reminder_hour, s.reminder_minute
            )));
        }
        if s.escalation_min_days >= s.escalation_max_days {
            return Err(VigilError::Config(format!(
                "escalation window [{}, {}) is empty",
                s.escalation_min_days, s.escalation_max_days
            )));
        }
        if s.batch_limit == 0 {
            return Err(VigilError::Config("batch_limit must be positive".into()));
        }
        if s.dispatch_interval_secs == 0 || s.occasion_interval_secs == 0 {
            return Err(VigilError::Config("intervals must be positive".into()));
        }
        if s.stale_sending_secs != 0 {
            s.check_stale_age(s.stale_sending_secs)?;
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Vigil home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vigil")
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.vigil/vigil.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// APNs token-auth credentials. Push is disabled unless key, team and bundle are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub bundle_id: String,
    /// Path to the `.p8` signing key.
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub production: bool,
}

impl PushConfig {
    pub fn is_complete(&self) -> bool {
        !self.key_id.is_empty()
            && !self.team_id.is_empty()
            && !self.bundle_id.is_empty()
            && !self.key_path.is_empty()
    }
}

/// SMTP email configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from_name() -> String { "死了么".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_user: String::new(),
            smtp_password: String::new(),
            from_email: String::new(),
            from_name: default_from_name(),
        }
    }
}

impl EmailConfig {
    pub fn is_complete(&self) -> bool {
        !self.smtp_host.is_empty() && !self.from_email.is_empty()
    }
}

/// Timers and business rules of the dispatcher and the occasion scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
    #[serde(default = "default_occasion_interval")]
    pub occasion_interval_secs: u64,
    /// Rows claimed per status per dispatch poll.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_reminder_hour")]
    pub reminder_hour: u32,
    #[serde(default)]
    pub reminder_minute: u32,
    #[serde(default = "default_escalation_min_days")]
    pub escalation_min_days: i64,
    #[serde(default = "default_escalation_max_days")]
    pub escalation_max_days: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Reclaim `sending` rows untouched for this long. 0 disables the sweep.
    #[serde(default)]
    pub stale_sending_secs: u64,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

/// Slack between the send timeout and the stale sweep's age, covering the
/// claim and the device-token lookup that precede a send.
pub const STALE_SENDING_MARGIN_SECS: u64 = 60;

impl SchedulerConfig {
    /// Shortest age at which a `sending` row can be reclaimed without
    /// racing an attempt that is still inside its send timeout.
    pub fn min_stale_age_secs(&self) -> u64 {
        self.send_timeout_secs.saturating_add(STALE_SENDING_MARGIN_SECS)
    }

    pub fn check_stale_age(&self, secs: u64) -> Result<()> {
        let min = self.min_stale_age_secs();
        if secs < min {
            return Err(VigilError::Config(format!(
                "stale sending age {secs}s must be at least {min}s \
                 (send timeout {}s + {STALE_SENDING_MARGIN_SECS}s)",
                self.send_timeout_secs
            )));
        }
        Ok(())
    }
}

fn default_dispatch_interval() -> u64 { 60 }
fn default_occasion_interval() -> u64 { 3600 }
fn default_batch_limit() -> usize { 100 }
fn default_send_timeout() -> u64 { 30 }
fn default_reminder_hour() -> u32 { 9 }
fn default_escalation_min_days() -> i64 { 3 }
fn default_escalation_max_days() -> i64 { 7 }
fn default_max_retries() -> u32 { crate::types::DEFAULT_MAX_RETRIES }
fn default_timezone() -> String { "UTC".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: default_dispatch_interval(),
            occasion_interval_secs: default_occasion_interval(),
            batch_limit: default_batch_limit(),
            send_timeout_secs: default_send_timeout(),
            reminder_hour: default_reminder_hour(),
            reminder_minute: 0,
            escalation_min_days: default_escalation_min_days(),
            escalation_max_days: default_escalation_max_days(),
            max_retries: default_max_retries(),
            stale_sending_secs: 0,
            default_timezone: default_timezone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = VigilConfig::default();
        assert_eq!(config.scheduler.batch_limit, 100);
        assert_eq!(config.scheduler.reminder_hour, 9);
        assert_eq!(config.scheduler.escalation_min_days, 3);
        assert_eq!(config.scheduler.escalation_max_days, 7);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.email.smtp_port, 587);
        assert!(!config.push.is_complete());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VigilConfig::from_toml(
            r#"
            [scheduler]
            dispatch_interval_secs = 15
            default_timezone = "Asia/Shanghai"

            [email]
            smtp_host = "smtp.example.com"
            from_email = "alerts@example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.dispatch_interval_secs, 15);
        assert_eq!(config.scheduler.occasion_interval_secs, 3600);
        assert_eq!(config.scheduler.default_timezone, "Asia/Shanghai");
        assert!(config.email.is_complete());
        assert_eq!(config.email.from_name, "死了么");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("APNS_KEY_ID", "KEY123"),
            ("APNS_TEAM_ID", "TEAM"),
            ("APNS_BUNDLE_ID", "com.example.app"),
            ("APNS_KEY_PATH", "/keys/apns.p8"),
            ("APNS_PRODUCTION", "true"),
            ("SMTP_PORT", "465"),
            ("FROM_NAME", ""),
        ]
        .into_iter()
        .collect();

        let mut config = VigilConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(config.push.is_complete());
        assert!(config.push.production);
        assert_eq!(config.email.smtp_port, 465);
        // empty values are ignored
        assert_eq!(config.email.from_name, "死了么");
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let mut config = VigilConfig::default();
        config.scheduler.escalation_min_days = 7;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.scheduler.reminder_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_sweep_must_outlast_send_timeout() {
        let mut config = VigilConfig::default();
        config.scheduler.send_timeout_secs = 30;

        // disabled
        config.scheduler.stale_sending_secs = 0;
        assert!(config.validate().is_ok());

        for secs in [5, 30, 89] {
            config.scheduler.stale_sending_secs = secs;
            assert!(config.validate().is_err(), "{secs}s accepted");
        }

        config.scheduler.stale_sending_secs = 90;
        assert!(config.validate().is_ok());
        config.scheduler.stale_sending_secs = 600;
        assert!(config.validate().is_ok());

        assert!(config.scheduler.check_stale_age(10).is_err());
        assert!(config.scheduler.check_stale_age(600).is_ok());
    }
}
