//! Classification of candidates against downstream records.
//!
//! Two batched queries per cycle, whatever the number of candidates:
//! 1. `jobs` rows whose `source_path` is a candidate: processing finished,
//!    the object was never cleaned up (orphaned success).
//! 2. `recordings` rows whose id is a remaining candidate's file stem and
//!    that have no job: processing started and died (failed early).
//!
//! Both groups are deleted from the store; the rest needs processing.

use std::collections::HashSet;

use common::Database;
use sqlx::{Postgres, QueryBuilder, Row, Sqlite};

use crate::error::ReconcileError;
use crate::metrics::ReconcilerMetrics;
use crate::store::{AudioStore, ObjectRecord};

/// Candidates split by downstream state.
#[derive(Debug, Default)]
pub struct Classification {
    pub orphaned_successes: Vec<ObjectRecord>,
    pub failed_early: Vec<ObjectRecord>,
    pub needs_processing: Vec<ObjectRecord>,
}

/// Outcome of [`ReconciliationEngine::reconcile`].
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub needs_processing: Vec<ObjectRecord>,
    pub orphaned_deleted: usize,
    pub failed_early_deleted: usize,
}

/// Downstream container id encoded in an object's file stem.
pub fn container_id(record: &ObjectRecord) -> Option<i64> {
    record.stem().parse::<i64>().ok().filter(|id| *id > 0)
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    database: Database,
    store: AudioStore,
    metrics: ReconcilerMetrics,
}

impl ReconciliationEngine {
    pub fn new(database: Database, store: AudioStore, metrics: ReconcilerMetrics) -> Self {
        Self {
            database,
            store,
            metrics,
        }
    }

    /// Classify `candidates` without touching the store.
    pub async fn classify(
        &self,
        candidates: Vec<ObjectRecord>,
    ) -> Result<Classification, ReconcileError> {
        let mut classification = Classification::default();
        if candidates.is_empty() {
            return Ok(classification);
        }

        let paths: Vec<&str> = candidates.iter().map(|record| record.path.as_str()).collect();
        let completed = self.completed_paths(&paths).await?;

        let mut remaining = Vec::with_capacity(candidates.len());
        for record in candidates {
            if completed.contains(&record.path) {
                classification.orphaned_successes.push(record);
            } else {
                remaining.push(record);
            }
        }

        let ids: Vec<i64> = remaining
            .iter()
            .filter_map(container_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let abandoned = if ids.is_empty() {
            HashSet::new()
        } else {
            self.abandoned_containers(&ids).await?
        };

        for record in remaining {
            if container_id(&record).is_some_and(|id| abandoned.contains(&id)) {
                classification.failed_early.push(record);
            } else {
                classification.needs_processing.push(record);
            }
        }

        tracing::debug!(
            orphaned_successes = classification.orphaned_successes.len(),
            failed_early = classification.failed_early.len(),
            needs_processing = classification.needs_processing.len(),
            "Classified candidates"
        );
        Ok(classification)
    }

    /// Classify `candidates` and delete everything already terminal.
    ///
    /// Deletes are best effort: a failed delete is logged and retried
    /// naturally by the next cycle.
    pub async fn reconcile(
        &self,
        candidates: Vec<ObjectRecord>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let classification = self.classify(candidates).await?;

        let mut outcome = ReconcileOutcome::default();
        for record in &classification.orphaned_successes {
            if self.delete_terminal(record, "orphaned_success").await {
                self.metrics.record_orphaned_success();
                outcome.orphaned_deleted += 1;
            }
        }
        for record in &classification.failed_early {
            if self.delete_terminal(record, "failed_early").await {
                self.metrics.record_failed_early();
                outcome.failed_early_deleted += 1;
            }
        }

        outcome.needs_processing = classification.needs_processing;
        Ok(outcome)
    }

    async fn delete_terminal(&self, record: &ObjectRecord, reason: &str) -> bool {
        match self.store.delete(&record.path).await {
            Ok(_) => {
                tracing::info!(path = %record.path, reason = reason, "Deleted reconciled object");
                true
            }
            Err(e) => {
                tracing::warn!(
                    path = %record.path,
                    reason = reason,
                    error = %e,
                    "Failed to delete reconciled object"
                );
                false
            }
        }
    }

    /// Query 1: candidate paths that already have a job.
    async fn completed_paths(&self, paths: &[&str]) -> Result<HashSet<String>, ReconcileError> {
        self.metrics.record_reconciliation_query();

        let found: HashSet<String> = match &self.database {
            Database::Sqlite(pool) => {
                let mut builder = QueryBuilder::<Sqlite>::new(
                    "SELECT DISTINCT source_path FROM jobs WHERE source_path IN (",
                );
                let mut separated = builder.separated(", ");
                for path in paths {
                    separated.push_bind(*path);
                }
                separated.push_unseparated(")");
                builder
                    .build()
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|row| row.try_get("source_path"))
                    .collect::<Result<_, _>>()?
            }
            Database::Postgres(pool) => {
                let mut builder = QueryBuilder::<Postgres>::new(
                    "SELECT DISTINCT source_path FROM jobs WHERE source_path IN (",
                );
                let mut separated = builder.separated(", ");
                for path in paths {
                    separated.push_bind(*path);
                }
                separated.push_unseparated(")");
                builder
                    .build()
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|row| row.try_get("source_path"))
                    .collect::<Result<_, _>>()?
            }
        };
        Ok(found)
    }

    /// Query 2: container ids without any job.
    async fn abandoned_containers(&self, ids: &[i64]) -> Result<HashSet<i64>, ReconcileError> {
        self.metrics.record_reconciliation_query();

        const SQL: &str = "SELECT CAST(r.id AS BIGINT) AS id FROM recordings r \
             WHERE NOT EXISTS (SELECT 1 FROM jobs j WHERE j.recording_id = r.id) \
             AND r.id IN (";

        let found: HashSet<i64> = match &self.database {
            Database::Sqlite(pool) => {
                let mut builder = QueryBuilder::<Sqlite>::new(SQL);
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
                builder
                    .build()
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|row| row.try_get("id"))
                    .collect::<Result<_, _>>()?
            }
            Database::Postgres(pool) => {
                let mut builder = QueryBuilder::<Postgres>::new(SQL);
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
                builder
                    .build()
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|row| row.try_get("id"))
                    .collect::<Result<_, _>>()?
            }
        };
        Ok(found)
    }
}
