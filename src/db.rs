use std::str::FromStr;

use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_STUDY_SCHEMA: &str = include_str!("../migrations/20250601000000_study_schema.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_study_schema.sql", MIGRATION_STUDY_SCHEMA),
];

/// Open (creating if missing) the SQLite database at `db_path` and apply
/// pending migrations. This must run before any repository is constructed.
pub async fn init_db_pool(db_path: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))
        .map_err(|e| DbError::ConnectionPool(format!("Invalid database path {}: {}", db_path, e)))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| DbError::ConnectionPool(format!("Failed to open {}: {}", db_path, e)))?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps every statement on
/// the same in-memory database.
pub async fn init_memory_pool() -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DbError::ConnectionPool(e.to_string()))?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DbError::ConnectionPool(format!("Failed to open in-memory db: {}", e)))?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply any migrations not yet recorded in the migrations table.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    create_migrations_table(pool).await?;
    let last_migration = get_last_migration(pool).await?;

    match &last_migration {
        Some(name) => debug!("last applied migration: {}", name),
        None => debug!("no migrations applied yet"),
    }

    apply_pending_migrations(pool, last_migration).await
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;

    Ok(())
}

async fn get_last_migration(pool: &SqlitePool) -> DbResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to get last migration: {}", e)))
}

async fn apply_pending_migrations(pool: &SqlitePool, last_migration: Option<String>) -> DbResult<()> {
    let pending = pending_migrations(last_migration);
    if pending.is_empty() {
        return Ok(());
    }

    info!("applying {} pending migration(s)", pending.len());

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to begin migration transaction: {}", e)))?;

    for (migration_name, migration_sql) in pending {
        debug!("applying migration {}", migration_name);

        sqlx::raw_sql(migration_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to apply {}: {}", migration_name, e)))?;

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(migration_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to record {}: {}", migration_name, e)))?;
    }

    tx.commit()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to commit migrations: {}", e)))?;

    Ok(())
}

fn pending_migrations(last_migration: Option<String>) -> Vec<(&'static str, &'static str)> {
    let mut pending = Vec::new();
    let mut should_include = last_migration.is_none();

    for (name, sql) in MIGRATIONS {
        if should_include {
            pending.push((*name, *sql));
        } else if Some(*name) == last_migration.as_deref() {
            should_include = true;
        }
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_migrations_selection() {
        let all = pending_migrations(None);
        assert_eq!(all.len(), MIGRATIONS.len());

        let after_last =
            pending_migrations(Some(MIGRATIONS[MIGRATIONS.len() - 1].0.to_string()));
        assert!(after_last.is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_pool_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");
        let pool = init_db_pool(path.to_str().unwrap()).await.unwrap();

        sqlx::query("SELECT COUNT(*) FROM study").fetch_one(&pool).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_in_memory_migrations_apply() {
        let pool = init_memory_pool().await.unwrap();

        // Applying twice is a no-op
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in [
            "cohort",
            "dataset",
            "dataset_property",
            "participant",
            "participant_visit",
            "qc_state",
            "study",
            "visit",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }
}
