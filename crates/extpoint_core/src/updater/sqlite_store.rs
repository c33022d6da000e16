//! SQLite-backed task-state store.
//!
//! # Responsibility
//! - Persist the task-state map as one JSON record in the `settings` table.
//!
//! # Invariants
//! - A missing row means "never initialized" and loads as `None`.
//! - Each `save` replaces the whole record in a single statement.

use crate::updater::store::{StoreResult, TaskStateMap, UpdateStateStore};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};

/// Settings key used when none is configured.
pub const DEFAULT_STATE_KEY: &str = "updater/state";

/// Task-state store over a migrated connection (see `db::open_db`).
pub struct SqliteStateStore<'conn> {
    conn: &'conn Connection,
    key: String,
}

impl<'conn> SqliteStateStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_key(conn, DEFAULT_STATE_KEY)
    }

    pub fn with_key(conn: &'conn Connection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Drops the record so the next pass sees a fresh installation.
    pub fn clear(&self) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1;", [&self.key])?;
        Ok(())
    }
}

impl UpdateStateStore for SqliteStateStore<'_> {
    fn load(&self) -> StoreResult<Option<TaskStateMap>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1;",
                [&self.key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, state: &TaskStateMap) -> StoreResult<()> {
        let value = serde_json::to_string(state)?;
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
            params![self.key, value, now_ms()],
        )?;
        debug!(
            "event=state_save module=updater status=ok key={} entries={}",
            self.key,
            state.len()
        );
        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
