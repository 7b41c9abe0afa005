//! Version-tracked schema for the knowledge-base store.
//!
//! `run_migrations()` reads the current version from `_migrations` and
//! applies the newer steps in order.

use libsql::Connection;
use tracing::info;

use crate::error::KbError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "kb_entries",
    sql: r#"
        CREATE TABLE IF NOT EXISTS kb_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#,
}];

pub async fn run_migrations(conn: &Connection) -> Result<(), KbError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| KbError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            version = migration.version,
            name = migration.name,
            "Applying knowledge-base migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            KbError::Migration(format!(
                "Migration V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| KbError::Migration(format!("Failed to record V{}: {e}", migration.version)))?;
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, KbError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| KbError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| KbError::Migration(format!("Failed to read migration version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| KbError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}
