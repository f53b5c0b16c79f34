//! SQLite rendition of the user/check-in collaborator.
//!
//! Lives alongside the notification table in the same database file. The
//! occasion scheduler only reads through [`UserDirectory`]; the write helpers
//! exist for the CLI and tests.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::UserDirectory;
use vigil_core::types::UserProfile;

use crate::clock;

pub struct SqliteUserDirectory {
    conn: Mutex<Connection>,
}

impl SqliteUserDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| VigilError::StoreUnavailable(format!("open {}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                push_token TEXT,
                push_enabled INTEGER NOT NULL DEFAULT 1,
                email_enabled INTEGER NOT NULL DEFAULT 0,
                emergency_contacts TEXT NOT NULL DEFAULT '[]',  -- JSON array
                timezone TEXT NOT NULL DEFAULT 'UTC'
            );

            CREATE TABLE IF NOT EXISTS checkins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                checked_at TEXT NOT NULL,
                local_date TEXT NOT NULL,     -- yyyy-mm-dd in the user's timezone
                UNIQUE (user_id, local_date)
            );
            CREATE INDEX IF NOT EXISTS idx_checkins_user ON checkins (user_id, checked_at);
            ",
        )
        .map_err(|e| VigilError::StoreUnavailable(format!("migration: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VigilError::StoreUnavailable(format!("lock: {e}")))
    }

    /// Insert or replace a user.
    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        let contacts = serde_json::to_string(&user.emergency_contacts)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, name, push_token, push_enabled, email_enabled, emergency_contacts, timezone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                push_token = excluded.push_token,
                push_enabled = excluded.push_enabled,
                email_enabled = excluded.email_enabled,
                emergency_contacts = excluded.emergency_contacts,
                timezone = excluded.timezone",
            params![
                user.id,
                user.name,
                user.push_token,
                user.push_enabled,
                user.email_enabled,
                contacts,
                user.timezone,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record a check-in at `at`, dated in the user's timezone. Returns
    /// `false` if the user already checked in on that local date.
    pub fn record_check_in(&self, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let tz_name: String = conn
            .query_row("SELECT timezone FROM users WHERE id = ?1", [user_id], |r| r.get(0))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| VigilError::NotFound(format!("user '{user_id}'")))?;

        let (tz, _) = clock::resolve_or(&tz_name, "UTC");
        let date = clock::local_date(at, tz).format("%Y-%m-%d").to_string();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO checkins (user_id, checked_at, local_date) VALUES (?1, ?2, ?3)",
                params![user_id, at.to_rfc3339_opts(SecondsFormat::Micros, true), date],
            )
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    fn query_users(&self, sql: &str) -> Result<Vec<UserProfile>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map([], row_to_user).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

const USER_COLUMNS: &str =
    "id, name, push_token, push_enabled, email_enabled, emergency_contacts, timezone";

fn db_err(e: rusqlite::Error) -> VigilError {
    VigilError::StoreUnavailable(e.to_string())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let contacts_json: String = row.get(5)?;
    let emergency_contacts: Vec<String> = serde_json::from_str(&contacts_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(UserProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        push_token: row.get(2)?,
        push_enabled: row.get(3)?,
        email_enabled: row.get(4)?,
        emergency_contacts,
        timezone: row.get(6)?,
    })
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [id],
            row_to_user,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_eligible_for_push(&self) -> Result<Vec<UserProfile>> {
        self.query_users(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE push_enabled = 1 AND push_token IS NOT NULL AND trim(push_token) <> ''
             ORDER BY id"
        ))
    }

    async fn list_eligible_for_email(&self) -> Result<Vec<UserProfile>> {
        self.query_users(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email_enabled = 1 ORDER BY id"
        ))
    }

    async fn has_check_in_on(&self, user_id: &str, date: NaiveDate) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM checkins WHERE user_id = ?1 AND local_date = ?2)",
            params![user_id, date.format("%Y-%m-%d").to_string()],
            |r| r.get::<_, bool>(0),
        )
        .map_err(db_err)
    }

    async fn last_check_in(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(checked_at) FROM checkins WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| VigilError::InvalidInput(format!("bad checked_at '{s}': {e}")))
        })
        .transpose()
    }
}
