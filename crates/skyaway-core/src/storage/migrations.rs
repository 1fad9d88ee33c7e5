//! Database schema migrations for skyaway.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    match conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    }) {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: users, events and participants.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS botuser (
            id          INTEGER PRIMARY KEY,
            username    TEXT NOT NULL DEFAULT '',
            first_name  TEXT NOT NULL DEFAULT '',
            last_name   TEXT NOT NULL DEFAULT '',
            enlisted    INTEGER NOT NULL DEFAULT 0,
            banned      INTEGER NOT NULL DEFAULT 0,
            admin       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS event (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            coins        INTEGER NOT NULL,
            duration     INTEGER,
            scheduled_at TEXT,
            started_at   TEXT,
            ended_at     TEXT,
            surprise     INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS participant (
            event_id    INTEGER NOT NULL REFERENCES event(id),
            user_id     INTEGER NOT NULL REFERENCES botuser(id),
            username    TEXT NOT NULL DEFAULT '',
            coins       INTEGER NOT NULL,
            claimed_at  TEXT,
            PRIMARY KEY (event_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_botuser_username ON botuser(username);
        CREATE INDEX IF NOT EXISTS idx_participant_unclaimed ON participant(event_id, claimed_at);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: at most one event without `ended_at`.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_event_single_current
            ON event ((ended_at IS NULL))
            WHERE ended_at IS NULL;",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_from_scratch() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('botuser', 'event', 'participant')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_migrate_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_single_current_event_index() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO event (coins) VALUES (10)", []).unwrap();
        let second = conn.execute("INSERT INTO event (coins) VALUES (20)", []);
        assert!(second.is_err());

        conn.execute("UPDATE event SET ended_at = 'x'", []).unwrap();
        conn.execute("INSERT INTO event (coins) VALUES (20)", []).unwrap();
        conn.execute("UPDATE event SET ended_at = 'y' WHERE ended_at IS NULL", [])
            .unwrap();
        conn.execute("INSERT INTO event (coins) VALUES (30)", []).unwrap();
    }
}
