//! Retry ledger backed by the `processing_attempts` table.
//!
//! The ledger is the only authority on how often the pipeline ran for a path.
//! Every error here is database-class and must reach the circuit breaker.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Database;
use sqlx::{Postgres, QueryBuilder, Row, Sqlite};

use crate::error::{ReconcileError, truncate_message};

/// Longest error text kept in the ledger.
pub const MAX_LEDGER_ERROR_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub path: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
}

#[async_trait]
pub trait RetryLedger: Send + Sync {
    /// Current record for `path`, if any.
    async fn get(&self, path: &str) -> Result<Option<AttemptRecord>, ReconcileError>;

    /// Current record for `path`, inserting a zero-attempt row when missing.
    async fn get_or_create(&self, path: &str) -> Result<AttemptRecord, ReconcileError>;

    /// Atomically add one attempt and return the new count.
    async fn record_attempt(&self, path: &str, error: &str) -> Result<u32, ReconcileError>;

    /// Remove the row for `path`. Removing an absent row is not an error.
    async fn delete(&self, path: &str) -> Result<(), ReconcileError>;

    /// Delete rows under `prefix` whose path is not in `present`.
    ///
    /// Returns the number of rows removed.
    async fn prune_missing(
        &self,
        prefix: &str,
        present: &HashSet<String>,
    ) -> Result<u64, ReconcileError>;
}

/// [`RetryLedger`] over the shared SQL database.
#[derive(Clone, Debug)]
pub struct SqlRetryLedger {
    database: Database,
}

impl SqlRetryLedger {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    async fn all_paths(&self) -> Result<Vec<String>, sqlx::Error> {
        let sql = "SELECT path FROM processing_attempts";
        match &self.database {
            Database::Sqlite(pool) => sqlx::query(sql)
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| row.try_get("path"))
                .collect(),
            Database::Postgres(pool) => sqlx::query(sql)
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| row.try_get("path"))
                .collect(),
        }
    }

    async fn delete_many(&self, paths: &[String]) -> Result<u64, sqlx::Error> {
        let affected = match &self.database {
            Database::Sqlite(pool) => {
                let mut builder =
                    QueryBuilder::<Sqlite>::new("DELETE FROM processing_attempts WHERE path IN (");
                let mut separated = builder.separated(", ");
                for path in paths {
                    separated.push_bind(path);
                }
                separated.push_unseparated(")");
                builder.build().execute(pool).await?.rows_affected()
            }
            Database::Postgres(pool) => {
                let mut builder = QueryBuilder::<Postgres>::new(
                    "DELETE FROM processing_attempts WHERE path IN (",
                );
                let mut separated = builder.separated(", ");
                for path in paths {
                    separated.push_bind(path);
                }
                separated.push_unseparated(")");
                builder.build().execute(pool).await?.rows_affected()
            }
        };
        Ok(affected)
    }
}

fn count_from_i64(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[async_trait]
impl RetryLedger for SqlRetryLedger {
    async fn get(&self, path: &str) -> Result<Option<AttemptRecord>, ReconcileError> {
        let record = match &self.database {
            Database::Sqlite(pool) => {
                let row = sqlx::query(
                    "SELECT path, attempt_count, last_error, last_attempt_at \
                     FROM processing_attempts WHERE path = ?",
                )
                .bind(path)
                .fetch_optional(pool)
                .await?;

                match row {
                    Some(row) => {
                        let last_attempt_at: String = row.try_get("last_attempt_at")?;
                        Some(AttemptRecord {
                            path: row.try_get("path")?,
                            attempt_count: count_from_i64(row.try_get("attempt_count")?),
                            last_error: row.try_get("last_error")?,
                            last_attempt_at: parse_timestamp(&last_attempt_at)?,
                        })
                    }
                    None => None,
                }
            }
            Database::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT path, attempt_count, last_error, last_attempt_at \
                     FROM processing_attempts WHERE path = $1",
                )
                .bind(path)
                .fetch_optional(pool)
                .await?;

                match row {
                    Some(row) => {
                        let attempt_count: i32 = row.try_get("attempt_count")?;
                        Some(AttemptRecord {
                            path: row.try_get("path")?,
                            attempt_count: count_from_i64(i64::from(attempt_count)),
                            last_error: row.try_get("last_error")?,
                            last_attempt_at: row.try_get("last_attempt_at")?,
                        })
                    }
                    None => None,
                }
            }
        };
        Ok(record)
    }

    async fn get_or_create(&self, path: &str) -> Result<AttemptRecord, ReconcileError> {
        match &self.database {
            Database::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO processing_attempts (path, attempt_count, last_error, last_attempt_at) \
                     VALUES (?, 0, NULL, ?) ON CONFLICT(path) DO NOTHING",
                )
                .bind(path)
                .bind(Utc::now().to_rfc3339())
                .execute(pool)
                .await?;
            }
            Database::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO processing_attempts (path, attempt_count, last_error, last_attempt_at) \
                     VALUES ($1, 0, NULL, NOW()) ON CONFLICT(path) DO NOTHING",
                )
                .bind(path)
                .execute(pool)
                .await?;
            }
        }

        self.get(path)
            .await?
            .ok_or(ReconcileError::Database(sqlx::Error::RowNotFound))
    }

    async fn record_attempt(&self, path: &str, error: &str) -> Result<u32, ReconcileError> {
        let error = truncate_message(error, MAX_LEDGER_ERROR_CHARS);

        let new_count = match &self.database {
            Database::Sqlite(pool) => {
                let row = sqlx::query(
                    "INSERT INTO processing_attempts (path, attempt_count, last_error, last_attempt_at) \
                     VALUES (?, 1, ?, ?) \
                     ON CONFLICT(path) DO UPDATE SET \
                         attempt_count = processing_attempts.attempt_count + 1, \
                         last_error = excluded.last_error, \
                         last_attempt_at = excluded.last_attempt_at \
                     RETURNING attempt_count",
                )
                .bind(path)
                .bind(&error)
                .bind(Utc::now().to_rfc3339())
                .fetch_one(pool)
                .await?;
                count_from_i64(row.try_get("attempt_count")?)
            }
            Database::Postgres(pool) => {
                let row = sqlx::query(
                    "INSERT INTO processing_attempts (path, attempt_count, last_error, last_attempt_at) \
                     VALUES ($1, 1, $2, NOW()) \
                     ON CONFLICT(path) DO UPDATE SET \
                         attempt_count = processing_attempts.attempt_count + 1, \
                         last_error = EXCLUDED.last_error, \
                         last_attempt_at = EXCLUDED.last_attempt_at \
                     RETURNING attempt_count",
                )
                .bind(path)
                .bind(&error)
                .fetch_one(pool)
                .await?;
                let count: i32 = row.try_get("attempt_count")?;
                count_from_i64(i64::from(count))
            }
        };

        tracing::debug!(path = %path, attempts = new_count, "Recorded processing attempt");
        Ok(new_count)
    }

    async fn delete(&self, path: &str) -> Result<(), ReconcileError> {
        match &self.database {
            Database::Sqlite(pool) => {
                sqlx::query("DELETE FROM processing_attempts WHERE path = ?")
                    .bind(path)
                    .execute(pool)
                    .await?;
            }
            Database::Postgres(pool) => {
                sqlx::query("DELETE FROM processing_attempts WHERE path = $1")
                    .bind(path)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn prune_missing(
        &self,
        prefix: &str,
        present: &HashSet<String>,
    ) -> Result<u64, ReconcileError> {
        let stale: Vec<String> = self
            .all_paths()
            .await?
            .into_iter()
            .filter(|path| path.starts_with(prefix) && !present.contains(path))
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self.delete_many(&stale).await?;
        tracing::info!(
            prefix = %prefix,
            removed = removed,
            "Pruned attempt records without a matching object"
        );
        Ok(removed)
    }
}
