//! Owner resolution: path layout parsing and the `users` lookup.

use common::Database;
use sqlx::Row;

use crate::error::ReconcileError;

/// Account that uploaded an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub id: i64,
    pub identity: String,
}

/// Owner identity of `path` under the `{scan_prefix}{identity}/{filename}` layout.
///
/// Anything else (nested directories, empty segments, foreign prefix) yields `None`.
pub fn parse_identity(scan_prefix: &str, path: &str) -> Option<String> {
    let rest = path.strip_prefix(scan_prefix)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);

    let mut segments = rest.split('/');
    let identity = segments.next()?.trim();
    let file_name = segments.next()?;
    if segments.next().is_some() || identity.is_empty() || file_name.is_empty() {
        return None;
    }
    Some(identity.to_string())
}

/// Read-only view of the pipeline's `users` table.
#[derive(Clone, Debug)]
pub struct OwnerDirectory {
    database: Database,
}

impl OwnerDirectory {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Find the owner for `identity`.
    ///
    /// Matches case-insensitively first. When several accounts differ only in
    /// case the exact spelling wins, otherwise the oldest account. Accounts
    /// that the case-insensitive match cannot see (legacy data with odd
    /// collations) are tried with an exact comparison last.
    pub async fn lookup_owner(&self, identity: &str) -> Result<Option<OwnerRecord>, ReconcileError> {
        let candidates = self.fetch_case_insensitive(identity).await?;
        if let Some(owner) = pick_owner(identity, candidates) {
            return Ok(Some(owner));
        }

        tracing::debug!(identity = %identity, "No case-insensitive owner match, trying exact match");
        Ok(self.fetch_exact(identity).await?)
    }

    async fn fetch_case_insensitive(&self, identity: &str) -> Result<Vec<OwnerRecord>, sqlx::Error> {
        match &self.database {
            Database::Sqlite(pool) => sqlx::query(
                "SELECT CAST(id AS BIGINT) AS id, username FROM users \
                 WHERE LOWER(username) = LOWER(?) ORDER BY id",
            )
            .bind(identity)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| {
                Ok(OwnerRecord {
                    id: row.try_get("id")?,
                    identity: row.try_get("username")?,
                })
            })
            .collect(),
            Database::Postgres(pool) => sqlx::query(
                "SELECT CAST(id AS BIGINT) AS id, username FROM users \
                 WHERE LOWER(username) = LOWER($1) ORDER BY id",
            )
            .bind(identity)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| {
                Ok(OwnerRecord {
                    id: row.try_get("id")?,
                    identity: row.try_get("username")?,
                })
            })
            .collect(),
        }
    }

    async fn fetch_exact(&self, identity: &str) -> Result<Option<OwnerRecord>, sqlx::Error> {
        let row = match &self.database {
            Database::Sqlite(pool) => sqlx::query(
                "SELECT CAST(id AS BIGINT) AS id, username FROM users \
                 WHERE username = ? ORDER BY id LIMIT 1",
            )
            .bind(identity)
            .fetch_optional(pool)
            .await?
            .map(|row| -> Result<OwnerRecord, sqlx::Error> {
                Ok(OwnerRecord {
                    id: row.try_get("id")?,
                    identity: row.try_get("username")?,
                })
            }),
            Database::Postgres(pool) => sqlx::query(
                "SELECT CAST(id AS BIGINT) AS id, username FROM users \
                 WHERE username = $1 ORDER BY id LIMIT 1",
            )
            .bind(identity)
            .fetch_optional(pool)
            .await?
            .map(|row| -> Result<OwnerRecord, sqlx::Error> {
                Ok(OwnerRecord {
                    id: row.try_get("id")?,
                    identity: row.try_get("username")?,
                })
            }),
        };
        row.transpose()
    }
}

/// `candidates` are ordered by id.
fn pick_owner(identity: &str, candidates: Vec<OwnerRecord>) -> Option<OwnerRecord> {
    if candidates.len() > 1 {
        tracing::warn!(
            identity = %identity,
            matches = candidates.len(),
            "Several owners match case-insensitively"
        );
    }
    let exact = candidates.iter().position(|owner| owner.identity == identity);
    let mut candidates = candidates;
    match exact {
        Some(index) => Some(candidates.swap_remove(index)),
        None => candidates.into_iter().next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_layout() {
        assert_eq!(
            parse_identity("uploads/", "uploads/alice/123.wav").as_deref(),
            Some("alice")
        );
        assert_eq!(
            parse_identity("uploads", "uploads/Bob/x.mp3").as_deref(),
            Some("Bob")
        );
        assert_eq!(parse_identity("uploads/", "uploads/123.wav"), None);
        assert_eq!(parse_identity("uploads/", "uploads/alice/sub/1.wav"), None);
        assert_eq!(parse_identity("uploads/", "uploads//1.wav"), None);
        assert_eq!(parse_identity("uploads/", "uploads/alice/"), None);
        assert_eq!(parse_identity("uploads/", "other/alice/1.wav"), None);
    }

    async fn directory() -> (Database, OwnerDirectory) {
        let database = Database::new_in_memory().await.unwrap();
        database.create_downstream_tables().await.unwrap();
        let Database::Sqlite(pool) = &database else {
            unreachable!()
        };
        for (id, name) in [(1, "alice"), (2, "Carol"), (3, "carol"), (4, "Dave")] {
            sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
                .bind(id)
                .bind(name)
                .execute(pool)
                .await
                .unwrap();
        }
        (database.clone(), OwnerDirectory::new(database))
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let (_db, directory) = directory().await;

        let owner = directory.lookup_owner("ALICE").await.unwrap().unwrap();
        assert_eq!(owner.id, 1);
        assert_eq!(owner.identity, "alice");

        let owner = directory.lookup_owner("dave").await.unwrap().unwrap();
        assert_eq!(owner.id, 4);
    }

    #[tokio::test]
    async fn test_lookup_prefers_exact_case_among_duplicates() {
        let (_db, directory) = directory().await;

        assert_eq!(directory.lookup_owner("carol").await.unwrap().unwrap().id, 3);
        assert_eq!(directory.lookup_owner("Carol").await.unwrap().unwrap().id, 2);
        // no exact spelling: oldest account
        assert_eq!(directory.lookup_owner("CAROL").await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_absent() {
        let (_db, directory) = directory().await;
        assert_eq!(directory.lookup_owner("mallory").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_users_table_is_database_error() {
        let database = Database::new_in_memory().await.unwrap();
        let directory = OwnerDirectory::new(database);

        let err = directory.lookup_owner("alice").await.unwrap_err();
        assert!(err.is_database());
    }
}
