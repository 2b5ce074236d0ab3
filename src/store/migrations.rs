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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversation_state (
                contact_phone TEXT PRIMARY KEY,
                current_stage TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                last_message_id TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS queue_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                correlation_id TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                metadata TEXT NOT NULL DEFAULT '{}',
                enqueued_at TEXT NOT NULL,
                available_at TEXT NOT NULL,
                last_attempt_at TEXT,
                locked_until TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_status ON queue_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_order ON queue_jobs(priority DESC, seq ASC);
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_correlation ON queue_jobs(correlation_id);
        "#,
    },
    Migration {
        version: 2,
        name: "message_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                contact_phone TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_messages_recorded
                ON processed_messages(recorded_at);
        "#,
    },
    Migration {
        version: 3,
        name: "queue_contact_order",
        sql: r#"
            ALTER TABLE queue_jobs ADD COLUMN contact_phone TEXT;
            UPDATE queue_jobs SET contact_phone = json_extract(metadata, '$.phone')
                WHERE contact_phone IS NULL;
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_contact
                ON queue_jobs(contact_phone, seq);
        "#,
    },
];

/// Create the `_migrations` table if needed and apply every pending migration.
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
        version = get_current_version(conn).await?,
        "Database migrations complete"
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
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
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

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "conversation_state",
            "queue_jobs",
            "processed_messages",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
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
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "message_ledger");

        let row3 = rows.next().await.unwrap().unwrap();
        assert_eq!(row3.get::<i64>(0).unwrap(), 3);
        assert_eq!(row3.get::<String>(1).unwrap(), "queue_contact_order");
    }

    #[tokio::test]
    async fn contact_column_is_backfilled_from_metadata() {
        let conn = test_conn().await;
        conn.execute_batch(MIGRATIONS[0].sql).await.unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).await.unwrap();
        seed_version(&conn, 1, "initial_schema").await.unwrap();
        seed_version(&conn, 2, "message_ledger").await.unwrap();
        conn.execute(
            "INSERT INTO queue_jobs (id, correlation_id, message_type, payload, metadata, enqueued_at, available_at)
             VALUES ('j-1', 'c', 'chatbot_message', '{}', '{\"phone\":\"5511\"}', 'x', 'x')",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT contact_phone FROM queue_jobs WHERE id = 'j-1'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "5511");
    }
}
