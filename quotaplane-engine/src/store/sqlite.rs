//! SQLite-backed specification store

use super::{migrations, plan_upsert, SpecStore, Upsert, DEFAULT_MAX_LIMITS};
use crate::validation;
use async_trait::async_trait;
use quotaplane_common::{Error, QuotaSpecification, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::InternalUnavailable(format!("{}: {}", context, e))
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Escape LIKE wildcards so a prefix matches literally
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Durable specification store
pub struct SqliteSpecStore {
    pool: SqlitePool,
    // SQLite cannot upgrade two concurrent readers to writers; writes queue here
    write_lock: Mutex<()>,
    max_limits: usize,
}

impl SqliteSpecStore {
    /// Open (creating if needed) the database and run migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if !is_memory_url(database_url) {
                if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        Error::InternalUnavailable(format!("Failed to create DB directory: {}", e))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(unavailable("Invalid database URL"))?
            .create_if_missing(true);

        // Every connection to an in-memory URL opens a fresh database, so the
        // pool is pinned to a single connection that is never recycled.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(unavailable("Database connection failed"))?;

        migrations::run_migrations(&pool).await?;
        tracing::info!(url = database_url, "Specification store ready");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            max_limits: DEFAULT_MAX_LIMITS,
        })
    }

    pub fn with_max_limits(mut self, max_limits: usize) -> Self {
        self.max_limits = max_limits;
        self
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Specification store closed");
    }
}

fn row_to_spec(row: &SqliteRow) -> Result<QuotaSpecification> {
    let body: String = row.try_get("spec").map_err(unavailable("Failed to read spec"))?;
    let create_index: i64 = row
        .try_get("create_index")
        .map_err(unavailable("Failed to read create_index"))?;
    let modify_index: i64 = row
        .try_get("modify_index")
        .map_err(unavailable("Failed to read modify_index"))?;

    let mut spec: QuotaSpecification = serde_json::from_str(&body)?;
    spec.create_index = create_index as u64;
    spec.modify_index = modify_index as u64;
    Ok(spec)
}

#[async_trait]
impl SpecStore for SqliteSpecStore {
    async fn put(&self, spec: QuotaSpecification) -> Result<QuotaSpecification> {
        validation::validate_specification(&spec, self.max_limits)?;

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(unavailable("Failed to begin upsert"))?;

        let existing = sqlx::query(
            "SELECT spec, create_index, modify_index FROM quota_specs WHERE name = ?",
        )
        .bind(&spec.name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable("Failed to load spec"))?
        .map(|row| row_to_spec(&row))
        .transpose()?;

        let needs_index = existing.as_ref().map_or(true, |current| !current.same_content(&spec));
        let next_index = if needs_index {
            sqlx::query("UPDATE store_index SET value = value + 1 WHERE id = 1")
                .execute(&mut *tx)
                .await
                .map_err(unavailable("Failed to advance store index"))?;

            let value: i64 = sqlx::query_scalar("SELECT value FROM store_index WHERE id = 1")
                .fetch_one(&mut *tx)
                .await
                .map_err(unavailable("Failed to read store index"))?;
            value as u64
        } else {
            0
        };

        let stored = match plan_upsert(existing.as_ref(), spec, || next_index) {
            Upsert::Unchanged(stored) => {
                tx.rollback().await.map_err(unavailable("Failed to end upsert"))?;
                return Ok(stored);
            }
            Upsert::Write(stored) => stored,
        };

        let body = serde_json::to_string(&stored)?;
        sqlx::query(
            "INSERT INTO quota_specs (name, spec, create_index, modify_index)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                spec = excluded.spec,
                modify_index = excluded.modify_index,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&stored.name)
        .bind(&body)
        .bind(stored.create_index as i64)
        .bind(stored.modify_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(unavailable("Failed to write spec"))?;

        tx.commit().await.map_err(unavailable("Failed to commit upsert"))?;

        tracing::debug!(
            quota = %stored.name,
            modify_index = stored.modify_index,
            "Stored quota specification"
        );
        Ok(stored)
    }

    async fn get(&self, name: &str) -> Result<QuotaSpecification> {
        let row = sqlx::query("SELECT spec, create_index, modify_index FROM quota_specs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("Failed to load spec"))?
            .ok_or_else(|| Error::quota_not_found(name))?;

        row_to_spec(&row)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM quota_specs WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(unavailable("Failed to delete spec"))?;

        if result.rows_affected() == 0 {
            return Err(Error::quota_not_found(name));
        }

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM quota_specs WHERE name LIKE ? ESCAPE '\\' ORDER BY name",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("Failed to list specs"))?;

        // LIKE is case-insensitive for ASCII in SQLite
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }
}
