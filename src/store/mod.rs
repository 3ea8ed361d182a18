//! Poll store client.
//!
//! Polls live in a `polls` table with a JSONB `options` column (array of
//! option strings) and a JSONB `results` column (object of per-option
//! counts). This core only reads the option lists and applies atomic
//! per-option increments; poll CRUD belongs to the API service.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read side of the poll store: the option strings of every poll.
#[async_trait]
pub trait OptionSource: Send + Sync {
    async fn tracked_options(&self) -> Result<Vec<String>, StoreError>;
}

/// Write side of the poll store: atomic per-option result increments.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Increment the result counter for `option` by `by` in every poll whose
    /// option set contains it. Missing counters count as zero. Safe to
    /// invoke repeatedly with the same arguments; the caller does not
    /// deduplicate retries.
    async fn apply_increment(&self, option: &str, by: u64) -> Result<(), StoreError>;
}

/// PostgreSQL-backed poll store.
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    /// Connect to the poll store. Failure here is fatal at startup.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl OptionSource for PgPollStore {
    async fn tracked_options(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT options FROM polls")
            .fetch_all(&self.pool)
            .await?;

        let mut options = Vec::new();
        for row in rows {
            let value: serde_json::Value = row.try_get("options")?;
            if let Some(list) = value.as_array() {
                options.extend(list.iter().filter_map(|o| o.as_str().map(str::to_string)));
            }
        }
        Ok(options)
    }
}

#[async_trait]
impl ResultStore for PgPollStore {
    async fn apply_increment(&self, option: &str, by: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE polls
            SET results = jsonb_set(
                    COALESCE(results, '{}'::jsonb),
                    ARRAY[$1],
                    to_jsonb(COALESCE((results->>$1)::bigint, 0) + $2)
                )
            WHERE options @> jsonb_build_array($1::text)
            "#,
        )
        .bind(option)
        .bind(by as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
