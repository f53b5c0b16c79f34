//! Read contract of the user and check-in collaborators.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::UserProfile;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>>;

    /// Users with push enabled and a non-empty device token.
    async fn list_eligible_for_push(&self) -> Result<Vec<UserProfile>>;

    /// Users with email alerts enabled.
    async fn list_eligible_for_email(&self) -> Result<Vec<UserProfile>>;

    /// Whether the user checked in on `date` (a calendar date in the user's timezone).
    async fn has_check_in_on(&self, user_id: &str, date: NaiveDate) -> Result<bool>;

    async fn last_check_in(&self, user_id: &str) -> Result<Option<DateTime<Utc>>>;
}
