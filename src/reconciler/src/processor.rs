//! Concurrency-bounded processing of candidates that need the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use serde::Serialize;

use crate::error::{ProcessingFailure, ReconcileError};
use crate::ledger::RetryLedger;
use crate::metrics::ReconcilerMetrics;
use crate::outcome::{Outcome, OutcomeHandler};
use crate::owner::{OwnerDirectory, parse_identity};
use crate::pipeline::ProcessingPipeline;
use crate::store::ObjectRecord;

/// Per-cycle processing counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    pub processed: usize,
    pub retrying: usize,
    pub permanently_failed: usize,
    /// Work not started because the pool was aborted.
    pub skipped: usize,
    /// Non-database errors caught at the task boundary.
    pub errors: usize,
}

pub struct Processor {
    scan_prefix: String,
    concurrency: usize,
    retry_limit: u32,
    ledger: Arc<dyn RetryLedger>,
    owners: OwnerDirectory,
    pipeline: Arc<dyn ProcessingPipeline>,
    outcomes: OutcomeHandler,
    metrics: ReconcilerMetrics,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scan_prefix: String,
        concurrency: usize,
        retry_limit: u32,
        ledger: Arc<dyn RetryLedger>,
        owners: OwnerDirectory,
        pipeline: Arc<dyn ProcessingPipeline>,
        outcomes: OutcomeHandler,
        metrics: ReconcilerMetrics,
    ) -> Self {
        Self {
            scan_prefix,
            concurrency: concurrency.max(1),
            retry_limit,
            ledger,
            owners,
            pipeline,
            outcomes,
            metrics,
        }
    }

    /// Process every candidate with at most `concurrency` in flight.
    ///
    /// A database error stops new work from starting; tasks already running
    /// finish, then the first database error is returned. Any other error is
    /// logged and counted.
    pub async fn process_all(
        &self,
        candidates: Vec<ObjectRecord>,
    ) -> Result<ProcessingSummary, ReconcileError> {
        let aborted = AtomicBool::new(false);

        let results: Vec<(String, Result<Option<Outcome>, ReconcileError>)> =
            futures::stream::iter(candidates)
                .map(|record| {
                    let aborted = &aborted;
                    async move {
                        if aborted.load(Ordering::Acquire) {
                            return (record.path, Ok(None));
                        }
                        let result = self.process_one(&record.path).await;
                        if matches!(&result, Err(e) if e.is_database()) {
                            aborted.store(true, Ordering::Release);
                        }
                        (record.path, result.map(Some))
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut summary = ProcessingSummary::default();
        let mut database_error = None;
        for (path, result) in results {
            match result {
                Ok(Some(Outcome::Processed)) => summary.processed += 1,
                Ok(Some(Outcome::Retrying { .. })) => summary.retrying += 1,
                Ok(Some(Outcome::PermanentlyFailed { .. })) => summary.permanently_failed += 1,
                Ok(None) => summary.skipped += 1,
                Err(e) if e.is_database() => {
                    tracing::error!(path = %path, error = %e, "Database error while processing");
                    database_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Processing task failed");
                    summary.errors += 1;
                }
            }
        }

        match database_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Drive one object from ledger check to outcome.
    pub async fn process_one(&self, path: &str) -> Result<Outcome, ReconcileError> {
        if let Some(record) = self.ledger.get(path).await?
            && record.attempt_count >= self.retry_limit
        {
            return self
                .outcomes
                .handle_exhausted(path, record.attempt_count)
                .await;
        }

        let Some(identity) = parse_identity(&self.scan_prefix, path) else {
            let failure = ProcessingFailure::UnparseableIdentity(path.to_string());
            return self.outcomes.handle_failure(path, &failure).await;
        };

        let Some(owner) = self.owners.lookup_owner(&identity).await? else {
            let failure = ProcessingFailure::OwnerNotFound(identity);
            return self.outcomes.handle_failure(path, &failure).await;
        };

        tracing::info!(path = %path, owner = %owner.identity, "Invoking pipeline");
        self.metrics.record_pipeline_invocation();
        match self.pipeline.process(path, &owner).await {
            Ok(()) => self.outcomes.handle_success(path).await,
            Err(failure) => self.outcomes.handle_failure(path, &failure).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqlRetryLedger;
    use crate::owner::OwnerRecord;
    use crate::store::AudioStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::Database;
    use object_store::memory::InMemory;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts calls and peak parallelism; fails paths containing "bad".
    #[derive(Default)]
    struct TrackingPipeline {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ProcessingPipeline for TrackingPipeline {
        async fn process(
            &self,
            path: &str,
            _owner: &OwnerRecord,
        ) -> Result<(), ProcessingFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if path.contains("bad") {
                Err(ProcessingFailure::pipeline("transcription", "unreadable audio"))
            } else {
                Ok(())
            }
        }
    }

    fn record(path: &str) -> ObjectRecord {
        ObjectRecord {
            path: path.to_string(),
            metadata: HashMap::new(),
            last_modified: Utc::now(),
            size: 4,
        }
    }

    async fn setup(
        concurrency: usize,
    ) -> (Database, Arc<SqlRetryLedger>, Arc<TrackingPipeline>, Processor) {
        let database = Database::new_in_memory().await.unwrap();
        database.create_downstream_tables().await.unwrap();
        let Database::Sqlite(pool) = &database else {
            unreachable!()
        };
        sqlx::query("INSERT INTO users (id, username) VALUES (1, 'alice')")
            .execute(pool)
            .await
            .unwrap();

        let store = AudioStore::new(Arc::new(InMemory::new()));
        let metrics = ReconcilerMetrics::new();
        let ledger = Arc::new(SqlRetryLedger::new(database.clone()));
        let pipeline = Arc::new(TrackingPipeline::default());
        let outcomes = OutcomeHandler::new(store, ledger.clone(), 3, metrics.clone());
        let processor = Processor::new(
            "uploads/".to_string(),
            concurrency,
            3,
            ledger.clone(),
            OwnerDirectory::new(database.clone()),
            pipeline.clone(),
            outcomes,
            metrics,
        );
        (database, ledger, pipeline, processor)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (_db, _ledger, pipeline, processor) = setup(2).await;
        let candidates = (1..=6)
            .map(|i| record(&format!("uploads/alice/{i}.wav")))
            .collect();

        let summary = processor.process_all(candidates).await.unwrap();

        assert_eq!(summary.processed, 6);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 6);
        assert!(pipeline.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_identity_and_owner_failures_do_not_invoke_pipeline() {
        let (_db, ledger, pipeline, processor) = setup(4).await;

        let summary = processor
            .process_all(vec![
                record("uploads/nested/dir/1.wav"),
                record("uploads/mallory/2.wav"),
                record("uploads/alice/bad.wav"),
            ])
            .await
            .unwrap();

        assert_eq!(summary.retrying, 3);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        for path in [
            "uploads/nested/dir/1.wav",
            "uploads/mallory/2.wav",
            "uploads/alice/bad.wav",
        ] {
            assert_eq!(ledger.get(path).await.unwrap().unwrap().attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_ledger_entry_skips_pipeline() {
        let (_db, ledger, pipeline, processor) = setup(1).await;
        for _ in 0..3 {
            ledger
                .record_attempt("uploads/alice/7.wav", "boom")
                .await
                .unwrap();
        }

        let outcome = processor.process_one("uploads/alice/7.wav").await.unwrap();

        assert_eq!(outcome, Outcome::PermanentlyFailed { attempts: 3 });
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.get("uploads/alice/7.wav").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_database_error_aborts_pool() {
        let (database, _ledger, pipeline, processor) = setup(1).await;
        database.close().await;

        let err = processor
            .process_all(vec![
                record("uploads/alice/1.wav"),
                record("uploads/alice/2.wav"),
            ])
            .await
            .unwrap_err();

        assert!(err.is_database());
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }
}
