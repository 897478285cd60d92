//! Specification store migrations

use quotaplane_common::{Error, Result};
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::InternalUnavailable(format!("Failed to create migrations table: {}", e)))?;

    // Run migrations in order
    run_migration(pool, "001_create_quota_specs_table", MIGRATION_001_CREATE_QUOTA_SPECS).await?;
    run_migration(pool, "002_create_store_index_table", MIGRATION_002_CREATE_STORE_INDEX).await?;
    run_migration(pool, "003_seed_store_index", MIGRATION_003_SEED_STORE_INDEX).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::InternalUnavailable(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::InternalUnavailable(format!("Migration {} failed: {}", name, e)))?;

    sqlx::query(sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::InternalUnavailable(format!("Migration {} failed: {}", name, e)))?;

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::InternalUnavailable(format!("Failed to record migration {}: {}", name, e)))?;

    tx.commit()
        .await
        .map_err(|e| Error::InternalUnavailable(format!("Migration {} failed: {}", name, e)))?;

    Ok(())
}

const MIGRATION_001_CREATE_QUOTA_SPECS: &str = "
CREATE TABLE IF NOT EXISTS quota_specs (
    name TEXT PRIMARY KEY,
    spec TEXT NOT NULL,
    create_index INTEGER NOT NULL,
    modify_index INTEGER NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const MIGRATION_002_CREATE_STORE_INDEX: &str = "
CREATE TABLE IF NOT EXISTS store_index (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
)";

const MIGRATION_003_SEED_STORE_INDEX: &str =
    "INSERT OR IGNORE INTO store_index (id, value) VALUES (1, 0)";
