//! Notification dispatch: claims due rows and hands them to their channel.
//!
//! One cycle walks `pending` then `retrying` rows, oldest-due first. Each row
//! is claimed with a compare-and-set before the send, so any number of
//! dispatchers can share a store; a lost claim is skipped without noise.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use vigil_core::config::STALE_SENDING_MARGIN_SECS;
use vigil_core::error::{Result, SendError, VigilError};
use vigil_core::traits::{NotificationChannel, UserDirectory};
use vigil_core::types::{Channel, Notification, NotificationStatus};

use crate::clock::Clock;
use crate::store::NotificationStore;

/// Wait before the next attempt, by the retry count after the failure.
const BACKOFF_MINUTES: [i64; 3] = [1, 5, 30];

/// Backoff for the `n`th retry: 1m, 5m, then 30m for every later attempt.
pub fn backoff(n: u32) -> Duration {
    let idx = (n.max(1) as usize - 1).min(BACKOFF_MINUTES.len() - 1);
    Duration::minutes(BACKOFF_MINUTES[idx])
}

/// Channel tag → sender, looked up at send time.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<Channel, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender under its own tag, replacing any previous one.
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.channel(), channel);
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn NotificationChannel>> {
        self.channels.get(&channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl FromIterator<Arc<dyn NotificationChannel>> for ChannelRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn NotificationChannel>>>(iter: I) -> Self {
        let mut registry = Self::new();
        for ch in iter {
            registry.register(ch);
        }
        registry
    }
}

/// Outcome counts of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Lost claims, rows that moved on mid-send, and rows whose processing
    /// hit a store error.
    pub skipped: usize,
}

impl DispatchReport {
    /// Rows this worker actually attempted.
    pub fn processed(&self) -> usize {
        self.sent + self.retried + self.failed
    }
}

enum Outcome {
    Sent,
    Retried,
    Failed,
    Skipped,
}

pub struct Dispatcher {
    store: Arc<NotificationStore>,
    channels: ChannelRegistry,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    send_timeout: std::time::Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<NotificationStore>,
        channels: ChannelRegistry,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            channels,
            directory,
            clock,
            batch_limit: 100,
            send_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_send_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    /// Return rows stuck in `sending` for longer than `older_than` to the retry queue.
    /// `older_than` must exceed the send timeout by the stale margin, or a row
    /// still being sent could be claimed a second time.
    pub fn reclaim_stale(&self, older_than: std::time::Duration) -> Result<usize> {
        let min = self.send_timeout + std::time::Duration::from_secs(STALE_SENDING_MARGIN_SECS);
        if older_than < min {
            return Err(VigilError::Config(format!(
                "stale sending age {older_than:?} is shorter than {min:?}"
            )));
        }
        let age = Duration::from_std(older_than)
            .map_err(|e| VigilError::Config(format!("stale age out of range: {e}")))?;
        let now = self.clock.now();
        self.store.reclaim_stale_sending(now - age, now)
    }

    /// Run one cycle and return the number of rows attempted.
    pub async fn run_dispatch_cycle(&self) -> Result<usize> {
        Ok(self.dispatch_cycle().await?.processed())
    }

    /// Run one cycle. A store failure while listing one status is logged and
    /// the other status is still worked; failures on individual rows are
    /// logged and skipped. Errors only when neither listing succeeded.
    pub async fn dispatch_cycle(&self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut listing_error = None;
        let mut listed = false;

        for status in [NotificationStatus::Pending, NotificationStatus::Retrying] {
            let due = match self.store.due(status, self.clock.now(), self.batch_limit) {
                Ok(due) => {
                    listed = true;
                    due
                }
                Err(e) => {
                    tracing::error!("Listing {status} notifications failed: {e}");
                    listing_error = Some(e);
                    continue;
                }
            };
            for notification in due {
                let outcome = match self.process(&notification, status).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(
                            "Dispatch of notification {} failed: {e}",
                            notification.id
                        );
                        Outcome::Skipped
                    }
                };
                match outcome {
                    Outcome::Sent => report.sent += 1,
                    Outcome::Retried => report.retried += 1,
                    Outcome::Failed => report.failed += 1,
                    Outcome::Skipped => report.skipped += 1,
                }
            }
        }

        if !listed {
            if let Some(e) = listing_error {
                return Err(e);
            }
        }

        if report.processed() > 0 {
            tracing::info!(
                "📬 Dispatch cycle: {} sent, {} retrying, {} failed",
                report.sent,
                report.retried,
                report.failed
            );
        }
        Ok(report)
    }

    async fn process(&self, n: &Notification, from: NotificationStatus) -> Result<Outcome> {
        if !self.store.claim(n.id, from, self.clock.now())? {
            tracing::debug!("Notification {} already claimed elsewhere", n.id);
            return Ok(Outcome::Skipped);
        }

        let result = self.send(n).await;
        self.finalize(n, result)
    }

    async fn send(&self, n: &Notification) -> std::result::Result<(), SendError> {
        let Some(channel) = self.channels.get(n.channel) else {
            return Err(VigilError::ChannelUnconfigured(n.channel.to_string()).into());
        };

        let recipient = match n.channel {
            Channel::Push => self.current_device_token(&n.user_id).await?,
            _ => n.recipient.clone(),
        };

        let attempt = channel.send(&recipient, &n.content.subject, &n.content.body, &n.content.data);
        match tokio::time::timeout(self.send_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SendError::retryable(format!(
                "{} send timed out after {:?}",
                n.channel, self.send_timeout
            ))),
        }
    }

    /// Device tokens rotate; the row's recipient may be stale by send time.
    async fn current_device_token(&self, user_id: &str) -> std::result::Result<String, SendError> {
        match self.directory.get_user(user_id).await {
            Ok(Some(user)) => user
                .device_token()
                .map(String::from)
                .ok_or_else(|| SendError::permanent(format!("user {user_id} has no device token"))),
            Ok(None) => Err(SendError::permanent(format!("user {user_id} not found"))),
            Err(e) => Err(SendError::retryable(format!("user lookup failed: {e}"))),
        }
    }

    fn finalize(&self, n: &Notification, result: std::result::Result<(), SendError>) -> Result<Outcome> {
        let now = self.clock.now();
        let err = match result {
            Ok(()) => {
                if self.store.mark_sent(n.id, now)? {
                    return Ok(Outcome::Sent);
                }
                tracing::error!(
                    "Notification {} was delivered but had already left sending; another attempt may duplicate it",
                    n.id
                );
                return Ok(Outcome::Skipped);
            }
            Err(err) => err,
        };

        if err.retryable && n.retry_count < n.max_retries {
            let attempt = n.retry_count + 1;
            let next = now + backoff(attempt);
            if self.store.mark_retrying(n.id, next, &err.message, now)? {
                tracing::warn!(
                    "⚠️ Notification {} ({}) retry {attempt}/{} at {next}: {}",
                    n.id,
                    n.channel,
                    n.max_retries,
                    err.message
                );
                return Ok(Outcome::Retried);
            }
        }

        if self.store.mark_failed(n.id, &err.message, now)? {
            tracing::warn!("❌ Notification {} ({}) failed: {}", n.id, n.channel, err.message);
            Ok(Outcome::Failed)
        } else {
            Ok(Outcome::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use serde_json::{Map, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use vigil_core::types::{NewOccurrence, NotificationContent, UserProfile};

    /// Replays scripted outcomes, then succeeds.
    struct ScriptedChannel {
        tag: Channel,
        script: Mutex<VecDeque<std::result::Result<(), SendError>>>,
        calls: Mutex<Vec<String>>,
        delay: Option<std::time::Duration>,
    }

    impl ScriptedChannel {
        fn new(tag: Channel, script: Vec<std::result::Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn channel(&self) -> Channel {
            self.tag
        }

        async fn send(
            &self,
            recipient: &str,
            _subject: &str,
            _body: &str,
            _data: &Map<String, Value>,
        ) -> std::result::Result<(), SendError> {
            self.calls.lock().unwrap().push(recipient.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct FixedDirectory(Vec<UserProfile>);

    #[async_trait]
    impl UserDirectory for FixedDirectory {
        async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
            Ok(self.0.iter().find(|u| u.id == id).cloned())
        }
        async fn list_eligible_for_push(&self) -> Result<Vec<UserProfile>> {
            Ok(self.0.clone())
        }
        async fn list_eligible_for_email(&self) -> Result<Vec<UserProfile>> {
            Ok(self.0.clone())
        }
        async fn has_check_in_on(&self, _: &str, _: NaiveDate) -> Result<bool> {
            Ok(false)
        }
        async fn last_check_in(&self, _: &str) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 1, 30, 0).unwrap()
    }

    fn u1() -> UserProfile {
        UserProfile {
            id: "U1".into(),
            push_token: Some("tok-new".into()),
            push_enabled: true,
            timezone: "Asia/Shanghai".into(),
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<NotificationStore>,
        clock: Arc<ManualClock>,
        dispatcher: Dispatcher,
    }

    fn harness(channel: Option<Arc<ScriptedChannel>>) -> Harness {
        let store = Arc::new(NotificationStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let registry: ChannelRegistry = channel
            .into_iter()
            .map(|c| c as Arc<dyn NotificationChannel>)
            .collect();
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            Arc::new(FixedDirectory(vec![u1()])),
            clock.clone(),
        );
        Harness {
            store,
            clock,
            dispatcher,
        }
    }

    fn enqueue(store: &NotificationStore, channel: Channel, recipient: &str, key: &str) -> i64 {
        let occ = NewOccurrence::new(
            "U1",
            channel,
            recipient,
            "Asia/Shanghai",
            t0(),
            NotificationContent::new("subject", "body"),
            key.to_string(),
        );
        store.create_occurrence(&occ, t0()).unwrap();
        store.find_active_by_key(key).unwrap().unwrap().id
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff(1), Duration::minutes(1));
        assert_eq!(backoff(2), Duration::minutes(5));
        assert_eq!(backoff(3), Duration::minutes(30));
        assert_eq!(backoff(4), Duration::minutes(30));
        assert_eq!(backoff(10), Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_successful_send() {
        let email = ScriptedChannel::new(Channel::Email, vec![]);
        let h = harness(Some(email.clone()));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        let report = h.dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(email.calls(), vec!["a@x.com"]);

        let row = h.store.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
        assert_eq!(row.sent_at, Some(t0()));

        // nothing left to do
        assert_eq!(h.dispatcher.run_dispatch_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_ends_failed() {
        let fail = || Err(SendError::retryable("smtp 421"));
        let email = ScriptedChannel::new(Channel::Email, vec![fail(), fail(), fail(), fail(), Ok(())]);
        let h = harness(Some(email.clone()));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        let mut waits = vec![Duration::minutes(1), Duration::minutes(5), Duration::minutes(30)].into_iter();
        h.dispatcher.dispatch_cycle().await.unwrap();
        for expected_count in 1..=3u32 {
            let row = h.store.get(id).unwrap().unwrap();
            assert_eq!(row.status, NotificationStatus::Retrying);
            assert_eq!(row.retry_count, expected_count);
            let wait = waits.next().unwrap();
            assert_eq!(row.scheduled_at, h.clock.now() + wait);

            // not due yet
            h.clock.advance(wait - Duration::seconds(1));
            assert_eq!(h.dispatcher.run_dispatch_cycle().await.unwrap(), 0);
            h.clock.advance(Duration::seconds(1));
            let report = h.dispatcher.dispatch_cycle().await.unwrap();
            assert_eq!(report.processed(), 1);
        }

        let row = h.store.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.error_message.as_deref(), Some("smtp 421"));
        assert_eq!(email.calls().len(), 4);

        h.clock.advance(Duration::hours(1));
        assert_eq!(h.dispatcher.run_dispatch_cycle().await.unwrap(), 0);
        assert_eq!(email.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let email = ScriptedChannel::new(
            Channel::Email,
            vec![Err(SendError::permanent("mailbox unavailable"))],
        );
        let h = harness(Some(email));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        let report = h.dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        let row = h.store.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.failed_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_missing_channel_fails_fast() {
        let h = harness(None);
        let id = enqueue(&h.store, Channel::Sms, "+8613800000000", "k");

        h.dispatcher.dispatch_cycle().await.unwrap();
        let row = h.store.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("channel not configured: sms"));
    }

    #[tokio::test]
    async fn test_push_uses_current_device_token() {
        let push = ScriptedChannel::new(Channel::Push, vec![]);
        let h = harness(Some(push.clone()));
        enqueue(&h.store, Channel::Push, "tok-old", "k");

        h.dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(push.calls(), vec!["tok-new"]);
    }

    #[tokio::test]
    async fn test_push_for_unknown_user_fails() {
        let push = ScriptedChannel::new(Channel::Push, vec![]);
        let h = harness(Some(push.clone()));
        let occ = NewOccurrence::new(
            "ghost",
            Channel::Push,
            "tok",
            "UTC",
            t0(),
            NotificationContent::new("s", "b"),
            "ghost_push_2024-01-01".into(),
        );
        h.store.create_occurrence(&occ, t0()).unwrap();

        let report = h.dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(push.calls().is_empty());
    }

    #[tokio::test]
    async fn test_slow_send_times_out_as_retryable() {
        let slow = Arc::new(ScriptedChannel {
            tag: Channel::Email,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Some(std::time::Duration::from_secs(5)),
        });
        let h = harness(Some(slow));
        let dispatcher = h
            .dispatcher
            .with_send_timeout(std::time::Duration::from_millis(20));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        let report = dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(report.retried, 1);
        let row = h.store.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Retrying);
        assert!(row.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_claimed_rows_are_not_dispatched_twice() {
        let email = ScriptedChannel::new(Channel::Email, vec![]);
        let h = harness(Some(email.clone()));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        // Another worker holds the row.
        assert!(h.store.claim(id, NotificationStatus::Pending, t0()).unwrap());
        let report = h.dispatcher.dispatch_cycle().await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(email.calls().is_empty());
    }

    #[test]
    fn test_reclaim_refuses_age_inside_send_timeout() {
        let h = harness(None);
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");
        assert!(h.store.claim(id, NotificationStatus::Pending, t0()).unwrap());
        h.clock.advance(Duration::seconds(10));

        // 5s is well inside the 30s send timeout; the row must stay owned.
        assert!(h.dispatcher.reclaim_stale(std::time::Duration::from_secs(5)).is_err());
        assert!(h.dispatcher.reclaim_stale(std::time::Duration::from_secs(60)).is_err());
        assert_eq!(h.store.get(id).unwrap().unwrap().status, NotificationStatus::Sending);
        assert!(!h.store.claim(id, NotificationStatus::Retrying, h.clock.now()).unwrap());

        h.clock.advance(Duration::minutes(15));
        assert_eq!(h.dispatcher.reclaim_stale(std::time::Duration::from_secs(600)).unwrap(), 1);
        assert_eq!(h.store.get(id).unwrap().unwrap().status, NotificationStatus::Retrying);
    }

    #[tokio::test]
    async fn test_delivery_after_row_moved_on_is_not_counted_sent() {
        let slow = Arc::new(ScriptedChannel {
            tag: Channel::Email,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Some(std::time::Duration::from_millis(200)),
        });
        let h = harness(Some(slow.clone()));
        let id = enqueue(&h.store, Channel::Email, "a@x.com", "k");

        let reclaim = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            // Due again only later, so this cycle's retrying pass leaves it alone.
            let later = t0() + Duration::hours(1);
            h.store.reclaim_stale_sending(later, later).unwrap()
        };
        let (report, reclaimed) = tokio::join!(h.dispatcher.dispatch_cycle(), reclaim);
        let report = report.unwrap();

        assert_eq!(reclaimed, 1);
        assert_eq!(slow.calls().len(), 1);
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.store.get(id).unwrap().unwrap().status, NotificationStatus::Retrying);
    }

    #[tokio::test]
    async fn test_batch_limit_per_status() {
        let email = ScriptedChannel::new(Channel::Email, vec![]);
        let h = harness(Some(email.clone()));
        for i in 0..5 {
            enqueue(&h.store, Channel::Email, "a@x.com", &format!("k{i}"));
        }
        let dispatcher = h.dispatcher.with_batch_limit(2);
        assert_eq!(dispatcher.run_dispatch_cycle().await.unwrap(), 2);
        assert_eq!(dispatcher.run_dispatch_cycle().await.unwrap(), 2);
        assert_eq!(dispatcher.run_dispatch_cycle().await.unwrap(), 1);
    }
}
