//! SQLite-backed notification store.
//!
//! Owns the `notifications` table and its state machine. Every transition is
//! a conditional UPDATE (`... WHERE id = ? AND status = ?`), so several
//! handles, in one process or many, can work the same file without locks
//! of their own: the row's current status is the only arbiter.
//! Rows are never deleted.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use vigil_core::error::{Result, VigilError};
use vigil_core::types::{NewOccurrence, Notification, NotificationContent, NotificationStatus};

const COLUMNS: &str = "id, unique_key, user_id, channel, recipient, status, retry_count, max_retries, \
     scheduled_at, sent_at, failed_at, error_message, content, timezone, created_at, updated_at";

/// Error recorded on rows moved back out of a stale `sending` state.
pub const STALE_RECLAIM_MESSAGE: &str = "reclaimed after stale sending";

/// Durable table of notification occurrences.
pub struct NotificationStore {
    conn: Mutex<Connection>,
}

impl NotificationStore {
    /// Open or create the store. `":memory:"` gives a private in-memory database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| VigilError::StoreUnavailable(format!("open {}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL lets readers proceed while another handle holds the write lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                unique_key TEXT NOT NULL,
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL CHECK (channel IN ('push', 'email', 'sms')),
                recipient TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'sending', 'sent', 'failed', 'retrying')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                scheduled_at TEXT NOT NULL,
                sent_at TEXT,
                failed_at TEXT,
                error_message TEXT,
                content TEXT NOT NULL DEFAULT '{}',   -- JSON {subject, body, data}
                timezone TEXT NOT NULL DEFAULT 'UTC',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (retry_count >= 0 AND retry_count <= max_retries)
            );

            -- A failed row is superseded: its key may be issued again.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_active_key
                ON notifications (unique_key) WHERE status <> 'failed';
            CREATE INDEX IF NOT EXISTS idx_notifications_due
                ON notifications (status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications (user_id, created_at);
            ",
        )
        .map_err(|e| VigilError::StoreUnavailable(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VigilError::StoreUnavailable(format!("lock: {e}")))
    }

    // ─── Creation ──────────────────────────────────────

    /// Insert a pending occurrence. A live row with the same `unique_key`
    /// turns this into a no-op; returns whether a row was created.
    pub fn create_occurrence(&self, occurrence: &NewOccurrence, now: DateTime<Utc>) -> Result<bool> {
        let content = serde_json::to_string(&occurrence.content)?;
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT INTO notifications
                 (unique_key, user_id, channel, recipient, status, retry_count, max_retries,
                  scheduled_at, content, timezone, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT (unique_key) WHERE status <> 'failed' DO NOTHING",
                params![
                    occurrence.unique_key,
                    occurrence.user_id,
                    occurrence.channel.as_str(),
                    occurrence.recipient,
                    occurrence.max_retries,
                    ts(occurrence.scheduled_at),
                    content,
                    occurrence.timezone,
                    ts(now),
                ],
            )
            .map_err(store_err)?;

        if inserted == 0 {
            tracing::debug!(unique_key = %occurrence.unique_key, "occurrence already exists");
        }
        Ok(inserted == 1)
    }

    // ─── Queries ──────────────────────────────────────

    pub fn get(&self, id: i64) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
            [id],
            row_to_notification,
        )
        .optional()
        .map_err(store_err)
    }

    /// The live (non-failed) row holding `key`, if any.
    pub fn find_active_by_key(&self, key: &str) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM notifications WHERE unique_key = ?1 AND status <> 'failed'"
            ),
            [key],
            row_to_notification,
        )
        .optional()
        .map_err(store_err)
    }

    /// Whether `base_key`, or any per-recipient key derived from it
    /// (`{base_key}_{recipient}`), has been sent.
    pub fn has_sent_for_key_family(&self, base_key: &str) -> Result<bool> {
        let prefix = format!("{base_key}_");
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM notifications
                WHERE status = 'sent'
                  AND (unique_key = ?1 OR substr(unique_key, 1, length(?2)) = ?2)
             )",
            params![base_key, prefix],
            |row| row.get::<_, bool>(0),
        )
        .map_err(store_err)
    }

    /// Rows in `status` whose `scheduled_at` has passed, oldest-due first.
    ///
    /// A row that cannot be decoded is moved to `failed` and left out, so it
    /// never holds up the rows behind it.
    pub fn due(
        &self,
        status: NotificationStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut due = Vec::new();
        let mut corrupt = Vec::new();
        {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM notifications
                     WHERE status = ?1 AND scheduled_at <= ?2
                     ORDER BY scheduled_at ASC, id ASC
                     LIMIT ?3"
                ))
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![status.as_str(), ts(now), limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row_to_notification(row)))
                })
                .map_err(store_err)?;
            for row in rows {
                match row.map_err(store_err)? {
                    (_, Ok(notification)) => due.push(notification),
                    (id, Err(e)) => corrupt.push((id, e.to_string())),
                }
            }
        }

        for (id, reason) in corrupt {
            tracing::error!("❌ Notification {id} is undecodable, marking failed: {reason}");
            conn.execute(
                "UPDATE notifications
                 SET status = 'failed', failed_at = ?3, error_message = ?4, updated_at = ?3
                 WHERE id = ?1 AND status = ?2",
                params![id, status.as_str(), ts(now), format!("undecodable row: {reason}")],
            )
            .map_err(store_err)?;
        }
        Ok(due)
    }

    /// A user's notifications, newest first.
    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_notification)
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    /// Row counts per status.
    pub fn count_by_status(&self) -> Result<Vec<(NotificationStatus, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM notifications GROUP BY status ORDER BY status")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((parse_col::<NotificationStatus>(row, 0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    // ─── Transitions ──────────────────────────────────────

    /// Compare-and-set `from → sending`. `false` means another worker got
    /// there first (or the row moved on); the caller must drop the attempt.
    pub fn claim(&self, id: i64, from: NotificationStatus, now: DateTime<Utc>) -> Result<bool> {
        if !from.is_claimable() {
            return Ok(false);
        }
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;
        let affected = tx
            .execute(
                "UPDATE notifications SET status = 'sending', updated_at = ?3
                 WHERE id = ?1 AND status = ?2",
                params![id, from.as_str(), ts(now)],
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(affected == 1)
    }

    /// `sending → sent`.
    pub fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE notifications SET status = 'sent', sent_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'sending'",
                params![id, ts(now)],
            )
            .map_err(store_err)?;
        Ok(affected == 1)
    }

    /// `sending → retrying`: bumps `retry_count` and reschedules. Refuses
    /// (returns `false`) once the retry budget is spent.
    pub fn mark_retrying(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE notifications
                 SET status = 'retrying', retry_count = retry_count + 1,
                     scheduled_at = ?2, error_message = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'sending' AND retry_count < max_retries",
                params![id, ts(next_attempt_at), error, ts(now)],
            )
            .map_err(store_err)?;
        Ok(affected == 1)
    }

    /// `sending → failed`.
    pub fn mark_failed(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE notifications
                 SET status = 'failed', failed_at = ?3, error_message = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'sending'",
                params![id, error, ts(now)],
            )
            .map_err(store_err)?;
        Ok(affected == 1)
    }

    /// Move `sending` rows untouched since `cutoff` back to `retrying`,
    /// due immediately. `retry_count` is left alone: the interrupted attempt
    /// never reported an outcome.
    pub fn reclaim_stale_sending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE notifications
                 SET status = 'retrying', scheduled_at = ?2, error_message = ?3, updated_at = ?2
                 WHERE status = 'sending' AND updated_at < ?1",
                params![ts(cutoff), ts(now), STALE_RECLAIM_MESSAGE],
            )
            .map_err(store_err)?;
        if affected > 0 {
            tracing::warn!("♻️ Reclaimed {affected} notification(s) stuck in sending");
        }
        Ok(affected)
    }
}

/// Fixed-width UTC timestamps so text order matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn store_err(e: rusqlite::Error) -> VigilError {
    VigilError::StoreUnavailable(e.to_string())
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let content_json: String = row.get(12)?;
    let content: NotificationContent =
        serde_json::from_str(&content_json).map_err(|e| conversion_err(12, e))?;

    Ok(Notification {
        id: row.get(0)?,
        unique_key: row.get(1)?,
        user_id: row.get(2)?,
        channel: parse_col(row, 3)?,
        recipient: row.get(4)?,
        status: parse_col(row, 5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        scheduled_at: parse_ts(row, 8)?,
        sent_at: parse_opt_ts(row, 9)?,
        failed_at: parse_opt_ts(row, 10)?,
        error_message: row.get(11)?,
        content,
        timezone: row.get(13)?,
        created_at: parse_ts(row, 14)?,
        updated_at: parse_ts(row, 15)?,
    })
}
