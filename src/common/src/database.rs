use std::fs;
use std::path::Path;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool, query};

/// Connection pool to the relational database (PostgreSQL or SQLite).
///
/// The worker owns the `processing_attempts` table. The `users`, `recordings`
/// and `jobs` tables belong to the processing pipeline and are only read.
#[derive(Clone, Debug)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    /// Connect and make sure the ledger table exists.
    pub async fn new(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to database with DSN: {dsn}");

        if dsn == "sqlite::memory:" {
            return Self::new_in_memory().await;
        }

        let database = if dsn.starts_with("sqlite:") {
            ensure_data_directory(dsn).map_err(sqlx::Error::Io)?;

            // Add mode=rwc to create database file if it doesn't exist
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };

            let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
                log::error!(
                    "Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}"
                );
                e
            })?;
            Database::Sqlite(pool)
        } else {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(dsn)
                .await
                .map_err(|e| {
                    log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                    e
                })?;
            Database::Postgres(pool)
        };

        log::info!("Database connection established successfully");
        database.init().await.map_err(|e| {
            log::error!("Failed to initialize ledger schema: {e}");
            e
        })?;
        Ok(database)
    }

    /// Single-connection in-memory SQLite database.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to one connection that is never recycled.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let database = Database::Sqlite(pool);
        database.init().await?;
        Ok(database)
    }

    /// Create the retry ledger table if it does not exist.
    async fn init(&self) -> Result<(), sqlx::Error> {
        match self {
            Database::Sqlite(pool) => {
                let create_attempts = r#"
                CREATE TABLE IF NOT EXISTS processing_attempts (
                    path TEXT PRIMARY KEY,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    last_attempt_at TEXT NOT NULL
                )"#;
                query(create_attempts).execute(pool).await?;
            }
            Database::Postgres(pool) => {
                let create_attempts = r#"
                CREATE TABLE IF NOT EXISTS processing_attempts (
                    path TEXT PRIMARY KEY,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    last_attempt_at TIMESTAMPTZ NOT NULL
                )"#;
                query(create_attempts).execute(pool).await?;
            }
        }

        Ok(())
    }

    /// Create the pipeline-owned tables the worker reads from.
    ///
    /// Production schemas are managed by the pipeline's migrations; this
    /// mirrors the columns the worker depends on.
    #[cfg(any(test, feature = "testing"))]
    pub async fn create_downstream_tables(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS recordings (
                id BIGINT PRIMARY KEY,
                user_id INTEGER
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                recording_id BIGINT,
                source_path TEXT NOT NULL
            )"#,
        ];

        for statement in statements {
            match self {
                Database::Sqlite(pool) => {
                    query(statement).execute(pool).await?;
                }
                Database::Postgres(pool) => {
                    query(statement).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        match self {
            Database::Sqlite(pool) => pool.close().await,
            Database::Postgres(pool) => pool.close().await,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Database::Sqlite(_) => "sqlite",
            Database::Postgres(_) => "postgres",
        }
    }
}

/// Ensure the directory of a file-backed SQLite database exists.
fn ensure_data_directory(dsn: &str) -> std::io::Result<()> {
    let Some(file_path) = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };

    let file_path = file_path.split('?').next().unwrap_or_default();
    if file_path.is_empty() || file_path == ":memory:" {
        return Ok(());
    }

    if let Some(parent) = Path::new(file_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
        log::info!("Created data directory: {}", parent.display());
    }
    Ok(())
}
