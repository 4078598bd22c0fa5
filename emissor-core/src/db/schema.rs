//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`
//! suffix) so that lexical comparison matches chronological order.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: receivers, durable queue, reports, settings
    r#"
    CREATE TABLE IF NOT EXISTS receivers (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        name             TEXT NOT NULL,
        url              TEXT NOT NULL,
        -- Sealed by the vault; NULL means no credential
        auth_token       TEXT,
        status           TEXT NOT NULL DEFAULT 'active',
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS queue_jobs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id          INTEGER NOT NULL,
        action           TEXT NOT NULL,
        -- Versioned JSON envelopes
        payload          JSON NOT NULL,
        receivers        JSON NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        created_at       DATETIME NOT NULL,
        claimed_at       DATETIME,
        processed_at     DATETIME,
        results          JSON,
        error            TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_jobs_status_created
        ON queue_jobs(status, created_at, id);
    CREATE INDEX IF NOT EXISTS idx_queue_jobs_post ON queue_jobs(post_id);

    CREATE TABLE IF NOT EXISTS reports (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id          INTEGER NOT NULL,
        timestamp        DATETIME NOT NULL,
        results          JSON NOT NULL,
        total            INTEGER NOT NULL,
        success          INTEGER NOT NULL,
        errors           INTEGER NOT NULL,
        success_rate     REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reports_post ON reports(post_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_reports_timestamp ON reports(timestamp);

    CREATE TABLE IF NOT EXISTS settings (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL,
        updated_at       DATETIME NOT NULL
    );
    "#,
    // Version 2: activity log and the short-lived notification slot
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        level            TEXT NOT NULL,
        message          TEXT NOT NULL,
        context          JSON NOT NULL DEFAULT '{}',
        timestamp        DATETIME NOT NULL,
        actor_id         INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_logs_level_timestamp ON logs(level, timestamp);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);

    CREATE TABLE IF NOT EXISTS notifications (
        slot             TEXT PRIMARY KEY,
        payload          JSON NOT NULL,
        expires_at       DATETIME NOT NULL
    );
    "#,
    // Version 3: claim ownership, so a cycle only finishes jobs it still holds
    r#"
    ALTER TABLE queue_jobs ADD COLUMN claim_token TEXT;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "receivers",
            "queue_jobs",
            "reports",
            "settings",
            "logs",
            "notifications",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_upgrade_from_first_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.execute("PRAGMA user_version = 1", []).unwrap();

        run_migrations(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let logs: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='logs'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(logs, 1);

        let has_claim_token: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('queue_jobs') WHERE name='claim_token'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(has_claim_token, 1);
    }
}
