//! Ordered schema migrations for the settings database.
//!
//! # Invariants
//! - Versions are strictly increasing; `PRAGMA user_version` mirrors the
//!   last applied one.
//! - All pending migrations commit together or not at all.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const SCHEMA: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_settings.sql"),
}];

/// Newest schema version this build understands.
pub fn latest_version() -> u32 {
    newest(SCHEMA)
}

/// Brings `conn` up to [`latest_version`].
///
/// # Errors
/// - [`DbError::UnsupportedSchemaVersion`] when the file was written by a
///   newer build.
/// - [`DbError::Sqlite`] when any statement fails; nothing is committed.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    migrate(conn, SCHEMA)
}

fn newest(schema: &[Migration]) -> u32 {
    schema.last().map_or(0, |migration| migration.version)
}

fn migrate(conn: &mut Connection, schema: &[Migration]) -> DbResult<()> {
    let from = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    let to = newest(schema);
    if from > to {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: to,
        });
    }
    let pending: Vec<&Migration> = schema
        .iter()
        .filter(|migration| migration.version > from)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in &pending {
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={} applied={}",
        from,
        to,
        pending.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{migrate, Migration, SCHEMA};
    use rusqlite::Connection;

    fn user_version(conn: &Connection) -> u32 {
        conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
            .expect("read user_version")
    }

    #[test]
    fn failing_migration_rolls_back_everything() {
        let mut conn = Connection::open_in_memory().expect("open");
        let broken = [
            SCHEMA[0],
            Migration {
                version: 2,
                sql: "CREATE TABLE broken (;",
            },
        ];

        migrate(&mut conn, &broken).expect_err("syntax error must fail");
        assert_eq!(user_version(&conn), 0);
        let settings: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'settings';",
                [],
                |row| row.get(0),
            )
            .expect("query sqlite_master");
        assert_eq!(settings, 0);
    }

    #[test]
    fn applies_only_pending_versions() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn, SCHEMA).expect("initial");
        let extended = [
            SCHEMA[0],
            Migration {
                version: 2,
                sql: "ALTER TABLE settings ADD COLUMN note TEXT;",
            },
        ];
        migrate(&mut conn, &extended).expect("second step");
        assert_eq!(user_version(&conn), 2);
    }
}
