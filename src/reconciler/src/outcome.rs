//! Routing of per-object results into the ledger, the store and diagnostics.

use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::error::{ProcessingFailure, ReconcileError};
use crate::ledger::RetryLedger;
use crate::metrics::ReconcilerMetrics;
use crate::store::AudioStore;

/// Terminal or intermediate state an object ends a cycle in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Retrying { attempts: u32 },
    PermanentlyFailed { attempts: u32 },
}

#[derive(Clone)]
pub struct OutcomeHandler {
    store: AudioStore,
    ledger: Arc<dyn RetryLedger>,
    diagnostics: Diagnostics,
    retry_limit: u32,
    metrics: ReconcilerMetrics,
}

impl OutcomeHandler {
    pub fn new(
        store: AudioStore,
        ledger: Arc<dyn RetryLedger>,
        retry_limit: u32,
        metrics: ReconcilerMetrics,
    ) -> Self {
        Self {
            diagnostics: Diagnostics::new(store.clone()),
            store,
            ledger,
            retry_limit,
            metrics,
        }
    }

    /// The pipeline finished: mark, delete the object, drop the ledger row.
    pub async fn handle_success(&self, path: &str) -> Result<Outcome, ReconcileError> {
        self.diagnostics.mark_processed(path).await;
        // A leftover object is picked up as an orphaned success next cycle.
        self.delete_object(path).await;
        self.ledger.delete(path).await?;

        self.metrics.record_processed();
        tracing::info!(path = %path, "Processed object");
        Ok(Outcome::Processed)
    }

    /// The pipeline (or owner resolution) failed: count it and decide.
    pub async fn handle_failure(
        &self,
        path: &str,
        failure: &ProcessingFailure,
    ) -> Result<Outcome, ReconcileError> {
        let error = failure.to_string();
        let attempts = self.ledger.record_attempt(path, &error).await?;

        if attempts >= self.retry_limit {
            tracing::warn!(
                path = %path,
                attempts = attempts,
                retry_limit = self.retry_limit,
                error = %error,
                "Retry limit reached, giving up on object"
            );
            self.diagnostics.mark_failed(path, attempts, &error).await;
            self.give_up(path).await?;
            return Ok(Outcome::PermanentlyFailed { attempts });
        }

        tracing::info!(
            path = %path,
            attempts = attempts,
            retry_limit = self.retry_limit,
            error = %error,
            "Processing failed, will retry next cycle"
        );
        self.diagnostics.mark_retrying(path, attempts, &error).await;
        self.metrics.record_retry_scheduled();
        Ok(Outcome::Retrying { attempts })
    }

    /// The ledger already holds `attempts >= retry_limit` for `path`.
    ///
    /// Happens when a previous run crashed between counting the last attempt
    /// and deleting the object, or after the retry limit was lowered.
    pub async fn handle_exhausted(
        &self,
        path: &str,
        attempts: u32,
    ) -> Result<Outcome, ReconcileError> {
        tracing::warn!(
            path = %path,
            attempts = attempts,
            "Attempts already exhausted, deleting without processing"
        );
        self.give_up(path).await?;
        Ok(Outcome::PermanentlyFailed { attempts })
    }

    /// Delete the object, then its ledger row.
    ///
    /// The row is kept while the object still exists so that the next cycle
    /// sees the exhausted count instead of a fresh object.
    async fn give_up(&self, path: &str) -> Result<(), ReconcileError> {
        if self.delete_object(path).await {
            self.ledger.delete(path).await?;
        }
        self.metrics.record_permanent_failure();
        Ok(())
    }

    async fn delete_object(&self, path: &str) -> bool {
        match self.store.delete(path).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to delete object");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{STATUS_KEY, STATUS_RETRYING};
    use crate::ledger::SqlRetryLedger;
    use common::Database;
    use object_store::PutPayload;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;

    const PATH: &str = "uploads/carol/789.wav";

    async fn setup(retry_limit: u32) -> (AudioStore, Arc<SqlRetryLedger>, OutcomeHandler) {
        let store = AudioStore::new(Arc::new(InMemory::new()));
        store
            .inner()
            .put(&ObjectPath::from(PATH), PutPayload::from_static(b"RIFF"))
            .await
            .unwrap();
        let ledger = Arc::new(SqlRetryLedger::new(Database::new_in_memory().await.unwrap()));
        let handler = OutcomeHandler::new(
            store.clone(),
            ledger.clone(),
            retry_limit,
            ReconcilerMetrics::new(),
        );
        (store, ledger, handler)
    }

    #[tokio::test]
    async fn test_success_deletes_object_and_ledger_row() {
        let (store, ledger, handler) = setup(3).await;
        ledger.record_attempt(PATH, "earlier failure").await.unwrap();

        let outcome = handler.handle_success(PATH).await.unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert!(!store.exists(PATH).await.unwrap());
        assert_eq!(ledger.get(PATH).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_below_limit_keeps_object() {
        let (store, ledger, handler) = setup(3).await;
        let failure = ProcessingFailure::pipeline("transcription", "model crashed");

        let outcome = handler.handle_failure(PATH, &failure).await.unwrap();

        assert_eq!(outcome, Outcome::Retrying { attempts: 1 });
        assert!(store.exists(PATH).await.unwrap());
        assert_eq!(ledger.get(PATH).await.unwrap().unwrap().attempt_count, 1);
        let metadata = store.get_metadata(PATH).await.unwrap().unwrap();
        assert_eq!(metadata[STATUS_KEY], STATUS_RETRYING);
    }

    #[tokio::test]
    async fn test_failure_at_limit_is_permanent() {
        let (store, ledger, handler) = setup(3).await;
        ledger.record_attempt(PATH, "one").await.unwrap();
        ledger.record_attempt(PATH, "two").await.unwrap();

        let failure = ProcessingFailure::OwnerNotFound("carol".to_string());
        let outcome = handler.handle_failure(PATH, &failure).await.unwrap();

        assert_eq!(outcome, Outcome::PermanentlyFailed { attempts: 3 });
        assert!(!store.exists(PATH).await.unwrap());
        assert_eq!(ledger.get(PATH).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exhausted_object_is_removed() {
        let (store, ledger, handler) = setup(2).await;
        ledger.record_attempt(PATH, "one").await.unwrap();
        ledger.record_attempt(PATH, "two").await.unwrap();

        let outcome = handler.handle_exhausted(PATH, 2).await.unwrap();

        assert_eq!(outcome, Outcome::PermanentlyFailed { attempts: 2 });
        assert!(!store.exists(PATH).await.unwrap());
        assert_eq!(ledger.get(PATH).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ledger_failure_propagates() {
        let store = AudioStore::new(Arc::new(InMemory::new()));
        let database = Database::new_in_memory().await.unwrap();
        let ledger = Arc::new(SqlRetryLedger::new(database.clone()));
        let handler = OutcomeHandler::new(store, ledger, 3, ReconcilerMetrics::new());
        database.close().await;

        let failure = ProcessingFailure::Timeout(std::time::Duration::from_secs(1));
        let err = handler.handle_failure(PATH, &failure).await.unwrap_err();
        assert!(err.is_database());
    }
}
