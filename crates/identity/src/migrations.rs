//! Forward-only schema migrations
//!
//! Applied on every open; each migration runs at most once and the set is
//! idempotent on startup. Never edit an existing migration, only append.

use rusqlite::Connection;
use trustplane_core::{Error, Result};

/// Ordered migration list. Index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "
    CREATE TABLE IF NOT EXISTS devices (
        device_id            TEXT PRIMARY KEY,
        mac                  TEXT NOT NULL,
        device_type          TEXT NOT NULL,
        fingerprint          TEXT NOT NULL,
        cert_serial          TEXT,
        status               TEXT NOT NULL,
        trust_score          INTEGER NOT NULL DEFAULT 70,
        first_seen           TEXT NOT NULL,
        onboarded_at         TEXT,
        last_seen            TEXT,
        profiling_started_at TEXT,
        heartbeat_expected   INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_devices_mac ON devices(mac);

    CREATE TABLE IF NOT EXISTS pending_devices (
        device_id   TEXT PRIMARY KEY,
        mac         TEXT NOT NULL,
        device_type TEXT NOT NULL,
        first_seen  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device_history (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id  TEXT NOT NULL,
        event      TEXT NOT NULL,
        detail     TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_device_history_device ON device_history(device_id);

    CREATE TABLE IF NOT EXISTS trust_score_history (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id  TEXT NOT NULL,
        score_after INTEGER NOT NULL,
        delta      INTEGER NOT NULL,
        reason     TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_trust_history_device ON trust_score_history(device_id);

    CREATE TABLE IF NOT EXISTS baselines (
        device_id TEXT PRIMARY KEY,
        baseline  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS policies (
        device_id  TEXT PRIMARY KEY,
        policy     TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS threats (
        source_ip   TEXT PRIMARY KEY,
        first_seen  TEXT NOT NULL,
        last_seen   TEXT NOT NULL,
        event_kinds TEXT NOT NULL,
        severity    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS mitigation_rules (
        source_ip  TEXT PRIMARY KEY,
        rule       TEXT NOT NULL,
        permanent  INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS decision_audit (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at     TEXT NOT NULL,
        device_id      TEXT NOT NULL,
        trust          INTEGER NOT NULL,
        threat_level   TEXT,
        decision       TEXT NOT NULL,
        reason         TEXT NOT NULL,
        prev_decision  TEXT,
        correlation_id TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_decision_audit_created ON decision_audit(created_at);
    ",
];

/// Apply all outstanding migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(Error::storage)?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(Error::storage)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }

        let tx = conn.transaction().map_err(Error::storage)?;
        tx.execute_batch(sql).map_err(Error::storage)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        tracing::info!(version, "applied identity schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);

        // Second run is a no-op
        run(&mut conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_tables_exist_after_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        for table in [
            "devices",
            "pending_devices",
            "device_history",
            "trust_score_history",
            "baselines",
            "policies",
            "threats",
            "mitigation_rules",
            "decision_audit",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
