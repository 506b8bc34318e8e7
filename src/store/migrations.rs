//! Versioned schema migrations for the task database.
//!
//! Each migration runs once, in order, and is recorded in `_migrations`.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        // IF NOT EXISTS lets registries created before migrations existed
        // adopt the tracking table in place.
        sql: r#"
            CREATE TABLE IF NOT EXISTS subagents (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                origin TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                spawned_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                stack_frame TEXT,
                result_summary TEXT
            );
        "#,
    },
    Migration {
        version: 2,
        name: "capacity_classes",
        sql: r#"
            ALTER TABLE subagents ADD COLUMN class TEXT;
            CREATE INDEX IF NOT EXISTS idx_subagents_status ON subagents(status);
            CREATE INDEX IF NOT EXISTS idx_subagents_class_status ON subagents(class, status);
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        "Task database migrations complete (at V{})",
        get_current_version(conn).await?
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn pre_migration_registry_is_adopted() {
        let conn = test_conn().await;

        // A registry table created before schema tracking existed.
        conn.execute_batch(
            "CREATE TABLE subagents (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                origin TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                spawned_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                stack_frame TEXT,
                result_summary TEXT
            );
            INSERT INTO subagents (id, label, origin, status, spawned_at)
                VALUES ('old1', '3.1', 'scheduled', 'running', '2026-01-01T00:00:00Z');",
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT label, class FROM subagents WHERE id = 'old1'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let label: String = row.get(0).unwrap();
        let class: Option<String> = row.get(1).ok();
        assert_eq!(label, "3.1");
        assert!(class.is_none());
    }
}
