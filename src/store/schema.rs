//! DuckDB schema definitions and migration support for the streak store.
//!
//! All items are gated behind `#[cfg(feature = "duckdb-store")]`.

use std::fmt;

use crate::model::StreakKey;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

/// One row per streak. `document` is the sparse JSON form of the streak;
/// the remaining columns are kept in step with it for predicate matching.
pub const DDL_FAILURE_STREAKS: &str = "\
CREATE TABLE IF NOT EXISTS failure_streaks (
    streak_id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    build_variant TEXT NOT NULL,
    task TEXT NOT NULL,
    test TEXT NOT NULL,
    first_order BIGINT NOT NULL,
    last_order BIGINT NOT NULL,
    closed BOOLEAN NOT NULL DEFAULT FALSE,
    document TEXT NOT NULL,
    updated_ts BIGINT NOT NULL
);";

/// Every order claimed by a streak. The primary key guarantees that no two
/// streaks for the same key claim the same commit.
pub const DDL_STREAK_COMMITS: &str = "\
CREATE TABLE IF NOT EXISTS streak_commits (
    project TEXT NOT NULL,
    build_variant TEXT NOT NULL,
    task TEXT NOT NULL,
    test TEXT NOT NULL,
    version_order BIGINT NOT NULL,
    streak_id TEXT NOT NULL,
    PRIMARY KEY (project, build_variant, task, test, version_order)
);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_FAILURE_STREAKS,
    DDL_STREAK_COMMITS,
];

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Uses `schema_version` table for idempotent version tracking.
/// Returns the version that was applied (or the already-current version).
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)
        .map_err(MigrationError::Duckdb)?;

    let current = get_current_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl).map_err(MigrationError::Duckdb)?;
        }
        record_version(conn, 1)?;
    }

    Ok(CURRENT_VERSION)
}

pub fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .map_err(MigrationError::Duckdb)?;
    let version: i32 = stmt
        .query_row([], |row| row.get(0))
        .map_err(MigrationError::Duckdb)?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, epoch_ms()],
    )
    .map_err(MigrationError::Duckdb)?;
    Ok(())
}

pub(crate) fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Streak identity
// ---------------------------------------------------------------------------

/// Deterministic row id for the streak of `key` starting at `first_order`.
///
/// sha256 over the NUL-separated key fields and the order, first 16 hex
/// chars. Re-minting the same streak always yields the same id.
pub fn streak_id(key: &StreakKey, first_order: i64) -> String {
    use sha2::{Digest, Sha256};
    let input = format!(
        "{}\0{}\0{}\0{}\0{first_order}",
        key.project, key.build_variant, key.task, key.test
    );
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MigrationError {
    Duckdb(duckdb::Error),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Duckdb(e) => write!(f, "DuckDB migration error: {e}"),
        }
    }
}

impl std::error::Error for MigrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&conn).unwrap(), CURRENT_VERSION);
        assert_eq!(apply_migrations(&conn).unwrap(), CURRENT_VERSION);
        assert_eq!(get_current_version(&conn).unwrap(), CURRENT_VERSION);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn streak_commits_rejects_double_claims() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let insert = "INSERT INTO streak_commits \
            (project, build_variant, task, test, version_order, streak_id) \
            VALUES ('p', 'b', 't', 'x', 100, ?)";
        conn.execute(insert, duckdb::params!["s1"]).unwrap();
        assert!(conn.execute(insert, duckdb::params!["s2"]).is_err());
    }

    #[test]
    fn streak_id_is_deterministic_and_key_sensitive() {
        let key = StreakKey::new("p", "b", "t", "x");
        let id = streak_id(&key, 100);
        assert_eq!(id.len(), 16);
        assert_eq!(id, streak_id(&key, 100));
        assert_ne!(id, streak_id(&key, 101));
        assert_ne!(id, streak_id(&StreakKey::new("p", "b", "t", "y"), 100));
        // Field boundaries matter.
        assert_ne!(
            streak_id(&StreakKey::new("ab", "c", "t", "x"), 1),
            streak_id(&StreakKey::new("a", "bc", "t", "x"), 1)
        );
    }
}
