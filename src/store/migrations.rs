//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs_and_tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT NOT NULL,
                role TEXT NOT NULL,
                party_id TEXT NOT NULL,
                dag TEXT NOT NULL,
                roles TEXT NOT NULL,
                initiator_party_id TEXT NOT NULL,
                scheduler_party_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                resource_in_use INTEGER NOT NULL DEFAULT 0,
                cores INTEGER NOT NULL DEFAULT 0,
                remaining_cores INTEGER NOT NULL DEFAULT 0,
                cancel_signal INTEGER NOT NULL DEFAULT 0,
                stop_status TEXT,
                rerun_signal INTEGER NOT NULL DEFAULT 0,
                ready_signal INTEGER NOT NULL DEFAULT 0,
                ready_time TEXT,
                ready_lease_until TEXT,
                apply_resource_time TEXT,
                error_report TEXT,
                created_at TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                updated_at TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                PRIMARY KEY (job_id, role, party_id)
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_scheduler ON jobs(scheduler_party_id);

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT NOT NULL,
                task_version INTEGER NOT NULL,
                role TEXT NOT NULL,
                party_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                component_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                party_status TEXT NOT NULL DEFAULT 'waiting',
                dependent_tasks TEXT NOT NULL DEFAULT '[]',
                scheduler_party_id TEXT NOT NULL,
                engine TEXT NOT NULL,
                task_cores INTEGER NOT NULL DEFAULT 0,
                resource_in_use INTEGER NOT NULL DEFAULT 0,
                auto_retries INTEGER NOT NULL DEFAULT 0,
                timeout_secs INTEGER NOT NULL DEFAULT 0,
                worker_handle TEXT,
                worker_instance TEXT,
                kill_status INTEGER NOT NULL DEFAULT 0,
                inputs TEXT NOT NULL DEFAULT '{}',
                outputs TEXT NOT NULL DEFAULT '{}',
                error_report TEXT,
                created_at TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, task_version, role, party_id)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_party_status ON tasks(party_status);
        "#,
    },
    Migration {
        version: 2,
        name: "engine_resources",
        sql: r#"
            CREATE TABLE IF NOT EXISTS engine_resources (
                engine TEXT PRIMARY KEY,
                total_cores INTEGER NOT NULL,
                remaining_cores INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                CHECK (remaining_cores >= 0 AND remaining_cores <= total_cores)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "schedule_lock_owner",
        sql: r#"
            ALTER TABLE jobs ADD COLUMN ready_owner TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
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
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
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
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["jobs", "tasks", "engine_resources", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(n1, "jobs_and_tasks");
        let row2 = rows.next().await.unwrap().unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(n2, "engine_resources");
        let row3 = rows.next().await.unwrap().unwrap();
        let n3: String = row3.get(1).unwrap();
        assert_eq!(n3, "schedule_lock_owner");
    }
}
