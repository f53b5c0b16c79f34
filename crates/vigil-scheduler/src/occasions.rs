//! Occasion scheduler: decides which notifications should exist.
//!
//! Two rules, both idempotent per user per local day:
//! - daily push reminder at the configured local time for users who have not
//!   checked in yet today;
//! - email escalation to emergency contacts once a user has missed check-ins
//!   for a number of days inside the escalation window.
//!
//! Nothing is sent here; rows are created `pending` for the dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use vigil_core::config::SchedulerConfig;
use vigil_core::error::Result;
use vigil_core::traits::UserDirectory;
use vigil_core::types::{
    Channel, NewOccurrence, NotificationContent, UserProfile, occurrence_key,
};

use crate::clock::{self, Clock};
use crate::store::NotificationStore;

const REMINDER_SUBJECT: &str = "打卡提醒";
const REMINDER_BODY: &str = "今天还没有打卡，快打开\"死了么\"打个卡吧！";

/// Business rules of both decisions.
#[derive(Debug, Clone)]
pub struct OccasionRules {
    pub reminder_hour: u32,
    pub reminder_minute: u32,
    /// Escalate when `min_days <= days since last check-in < max_days`.
    pub escalation_min_days: i64,
    pub escalation_max_days: i64,
    pub max_retries: u32,
    pub default_timezone: String,
}

impl Default for OccasionRules {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for OccasionRules {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            reminder_hour: c.reminder_hour,
            reminder_minute: c.reminder_minute,
            escalation_min_days: c.escalation_min_days,
            escalation_max_days: c.escalation_max_days,
            max_retries: c.max_retries,
            default_timezone: c.default_timezone.clone(),
        }
    }
}

/// What one scheduling pass created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulingReport {
    pub push_created: usize,
    pub email_created: usize,
    /// Users whose evaluation hit an error; the rest of the batch still ran.
    pub users_skipped: usize,
}

impl std::ops::AddAssign for SchedulingReport {
    fn add_assign(&mut self, other: Self) {
        self.push_created += other.push_created;
        self.email_created += other.email_created;
        self.users_skipped += other.users_skipped;
    }
}

pub struct OccasionScheduler {
    store: Arc<NotificationStore>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    rules: OccasionRules,
}

impl OccasionScheduler {
    pub fn new(
        store: Arc<NotificationStore>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        rules: OccasionRules,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            rules,
        }
    }

    /// Run both rules. A rule that cannot list its users is logged and the
    /// other rule still runs.
    pub async fn run_scheduling_cycle(&self) -> SchedulingReport {
        let mut report = SchedulingReport::default();

        match self.schedule_daily_push_reminders().await {
            Ok(r) => report += r,
            Err(e) => tracing::error!("Daily reminder scheduling aborted: {e}"),
        }
        match self.escalate_missed_check_ins().await {
            Ok(r) => report += r,
            Err(e) => tracing::error!("Missed check-in escalation aborted: {e}"),
        }

        if report.push_created + report.email_created > 0 {
            tracing::info!(
                "📅 Scheduled {} reminder(s), {} escalation email(s)",
                report.push_created,
                report.email_created
            );
        }
        report
    }

    /// Daily reminder for every push-eligible user without a check-in today.
    pub async fn schedule_daily_push_reminders(&self) -> Result<SchedulingReport> {
        let users = self.directory.list_eligible_for_push().await?;
        let now = self.clock.now();
        let mut report = SchedulingReport::default();

        for user in &users {
            match self.remind(user, now).await {
                Ok(true) => report.push_created += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Reminder for user {} skipped: {e}", user.id);
                    report.users_skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn remind(&self, user: &UserProfile, now: DateTime<Utc>) -> Result<bool> {
        let Some(token) = user.device_token() else {
            return Ok(false);
        };
        let timezone = self.user_timezone(user);
        let tz = clock::resolve_timezone(&timezone)?;
        let today = clock::local_date(now, tz);

        if self.directory.has_check_in_on(&user.id, today).await? {
            return Ok(false);
        }

        // Past the reminder time: send now rather than schedule in the past.
        let target = clock::at_time_of_day(
            &timezone,
            self.rules.reminder_hour,
            self.rules.reminder_minute,
            now,
        )?;
        let scheduled_at = target.max(now);

        let date = today.format("%Y-%m-%d").to_string();
        let content = NotificationContent::new(REMINDER_SUBJECT, REMINDER_BODY)
            .with_data("kind", "daily_reminder")
            .with_data("date", date.clone());
        let occurrence = NewOccurrence::new(
            &user.id,
            Channel::Push,
            token,
            &timezone,
            scheduled_at,
            content,
            occurrence_key(&user.id, Channel::Push, &date, None),
        )
        .with_max_retries(self.rules.max_retries);

        self.store.create_occurrence(&occurrence, now)
    }

    /// One email per emergency contact for users inside the escalation window.
    pub async fn escalate_missed_check_ins(&self) -> Result<SchedulingReport> {
        let users = self.directory.list_eligible_for_email().await?;
        let now = self.clock.now();
        let mut report = SchedulingReport::default();

        for user in &users {
            match self.escalate(user, now).await {
                Ok(created) => report.email_created += created,
                Err(e) => {
                    tracing::warn!("⚠️ Escalation for user {} skipped: {e}", user.id);
                    report.users_skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn escalate(&self, user: &UserProfile, now: DateTime<Utc>) -> Result<usize> {
        let contacts = user.contact_emails();
        if contacts.is_empty() {
            return Ok(0);
        }
        let timezone = self.user_timezone(user);

        // Never checked in counts as day 0: this rule does not fire.
        let days = match self.directory.last_check_in(&user.id).await? {
            Some(last) => clock::days_since(last, &timezone, now)?,
            None => 0,
        };
        if days < self.rules.escalation_min_days || days >= self.rules.escalation_max_days {
            return Ok(0);
        }

        let date = clock::date_string(now, &timezone)?;
        let base_key = occurrence_key(&user.id, Channel::Email, &date, None);
        if self.store.has_sent_for_key_family(&base_key)? {
            return Ok(0);
        }

        let content = escalation_content(user.display_name(), days);
        let mut created = 0;
        for contact in contacts {
            let occurrence = NewOccurrence::new(
                &user.id,
                Channel::Email,
                contact,
                &timezone,
                now,
                content.clone(),
                occurrence_key(&user.id, Channel::Email, &date, Some(contact)),
            )
            .with_max_retries(self.rules.max_retries);
            if self.store.create_occurrence(&occurrence, now)? {
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!("🚨 User {} missed {days} day(s): alerting {created} contact(s)", user.id);
        }
        Ok(created)
    }

    /// The user's timezone name, or the default when it is blank or unknown.
    fn user_timezone(&self, user: &UserProfile) -> String {
        match clock::resolve_timezone(&user.timezone) {
            Ok(tz) => tz.name().to_string(),
            Err(_) => {
                let (tz, _) = clock::resolve_or(&self.rules.default_timezone, "UTC");
                tracing::warn!(
                    "⚠️ User {} has unknown timezone '{}', using {}",
                    user.id,
                    user.timezone,
                    tz.name()
                );
                tz.name().to_string()
            }
        }
    }
}

fn escalation_content(name: &str, days: i64) -> NotificationContent {
    let subject = format!("紧急提醒：{name} 已连续多日未打卡");
    let body = format!(
        "您好，\n\n{name} 已连续 {days} 天未在\"死了么\"应用中打卡。\n\n\
         请及时联系确认其安全状况。\n\n此邮件由系统自动发送。\n"
    );
    NotificationContent::new(subject, body)
        .with_data("kind", "missed_check_in")
        .with_data("days", days)
}
