//! Poll loop orchestrator.
//!
//! One cycle is `Scanning -> Filtering -> Reconciling -> Processing` and back
//! to `Idle`. Database-class errors abort the cycle and count towards the
//! circuit breaker; once `failure_threshold` cycles in a row failed that way
//! the poller moves to `Stopped` for good and needs an external restart. Any
//! other outcome resets the count.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::Database;
use common::config::ReconcilerConfig;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::filter::CandidateFilter;
use crate::ledger::{RetryLedger, SqlRetryLedger};
use crate::metrics::ReconcilerMetrics;
use crate::outcome::OutcomeHandler;
use crate::owner::OwnerDirectory;
use crate::pipeline::ProcessingPipeline;
use crate::processor::{ProcessingSummary, Processor};
use crate::reconcile::ReconciliationEngine;
use crate::store::AudioStore;

/// Share of the poll interval a cycle may take before we warn about falling behind.
const SLOW_CYCLE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerState {
    Idle,
    Scanning,
    Filtering,
    Reconciling,
    Processing,
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PollerState::Idle => "idle",
            PollerState::Scanning => "scanning",
            PollerState::Filtering => "filtering",
            PollerState::Reconciling => "reconciling",
            PollerState::Processing => "processing",
            PollerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// What one completed cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub objects_scanned: usize,
    pub ignored: usize,
    pub filtered_deleted: usize,
    pub stale_attempts_pruned: u64,
    pub candidates: usize,
    pub orphaned_deleted: usize,
    pub failed_early_deleted: usize,
    pub processing: ProcessingSummary,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The previous cycle was still running.
    Skipped,
    Failed { database: bool, error: ReconcileError },
    /// The poller is stopped; nothing ran.
    Halted,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Stopped,
    CircuitOpen { consecutive_failures: u32 },
}

pub struct Poller {
    config: ReconcilerConfig,
    store: AudioStore,
    ledger: Arc<dyn RetryLedger>,
    filter: CandidateFilter,
    engine: ReconciliationEngine,
    processor: Processor,
    metrics: ReconcilerMetrics,
    state: Mutex<PollerState>,
    cycle_in_progress: AtomicBool,
    consecutive_db_failures: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl Poller {
    /// Wire every component over a shared database and store.
    pub fn new(
        config: ReconcilerConfig,
        database: Database,
        store: AudioStore,
        pipeline: Arc<dyn ProcessingPipeline>,
    ) -> Self {
        let metrics = ReconcilerMetrics::new();
        let ledger: Arc<dyn RetryLedger> = Arc::new(SqlRetryLedger::new(database.clone()));
        let outcomes = OutcomeHandler::new(
            store.clone(),
            ledger.clone(),
            config.retry_limit,
            metrics.clone(),
        );
        let processor = Processor::new(
            config.scan_prefix.clone(),
            config.concurrency,
            config.retry_limit,
            ledger.clone(),
            OwnerDirectory::new(database.clone()),
            pipeline,
            outcomes,
            metrics.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            filter: CandidateFilter::new(&config),
            engine: ReconciliationEngine::new(database, store.clone(), metrics.clone()),
            config,
            store,
            ledger,
            processor,
            metrics,
            state: Mutex::new(PollerState::Idle),
            cycle_in_progress: AtomicBool::new(false),
            consecutive_db_failures: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn metrics(&self) -> &ReconcilerMetrics {
        &self.metrics
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: PollerState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Stopped is terminal
        if *current != PollerState::Stopped {
            *current = state;
        }
    }

    pub fn consecutive_db_failures(&self) -> u32 {
        self.consecutive_db_failures.load(Ordering::Acquire)
    }

    pub fn is_cycle_in_progress(&self) -> bool {
        self.cycle_in_progress.load(Ordering::Acquire)
    }

    /// Run one guarded cycle and update the circuit breaker.
    pub async fn tick(&self) -> CycleOutcome {
        if self.state() == PollerState::Stopped {
            return CycleOutcome::Halted;
        }

        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Previous cycle still running, skipping this one");
            self.metrics.record_cycle_skipped();
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard(&self.cycle_in_progress);

        let cycle_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self
            .run_cycle(cycle_id)
            .instrument(tracing::info_span!("cycle", cycle_id = %cycle_id))
            .await;
        let elapsed = started.elapsed();
        self.set_state(PollerState::Idle);
        self.warn_if_slow(elapsed);

        match result {
            Ok(mut report) => {
                report.duration_ms = elapsed.as_millis() as u64;
                self.consecutive_db_failures.store(0, Ordering::Release);
                self.metrics.record_cycle_completed(elapsed);
                tracing::info!(
                    cycle_id = %cycle_id,
                    duration_ms = report.duration_ms,
                    candidates = report.candidates,
                    processed = report.processing.processed,
                    "Cycle completed"
                );
                CycleOutcome::Completed(report)
            }
            Err(error) if error.is_database() => {
                let failures = self.consecutive_db_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.metrics.record_cycle_failed(elapsed, true);
                tracing::error!(
                    cycle_id = %cycle_id,
                    consecutive_failures = failures,
                    threshold = self.config.failure_threshold,
                    error = %error,
                    "Cycle aborted by database error"
                );

                if failures >= self.config.failure_threshold {
                    self.trip_circuit(failures);
                }
                CycleOutcome::Failed {
                    database: true,
                    error,
                }
            }
            Err(error) => {
                self.consecutive_db_failures.store(0, Ordering::Release);
                self.metrics.record_cycle_failed(elapsed, false);
                tracing::warn!(cycle_id = %cycle_id, error = %error, "Cycle aborted");
                CycleOutcome::Failed {
                    database: false,
                    error,
                }
            }
        }
    }

    fn trip_circuit(&self, failures: u32) {
        self.set_state(PollerState::Stopped);
        self.metrics.record_circuit_trip();
        tracing::error!(
            fatal = true,
            consecutive_failures = failures,
            "Circuit breaker open: database keeps failing, poller stopped until restarted"
        );
    }

    fn warn_if_slow(&self, elapsed: Duration) {
        let budget = self.config.poll_interval.mul_f64(SLOW_CYCLE_RATIO);
        if elapsed > budget {
            tracing::warn!(
                duration_ms = elapsed.as_millis() as u64,
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "Cycle took longer than 80% of the poll interval"
            );
        }
    }

    async fn run_cycle(&self, cycle_id: Uuid) -> Result<CycleReport, ReconcileError> {
        let prefix = self.config.scan_prefix.as_str();

        self.set_state(PollerState::Scanning);
        let snapshot = self.store.list(prefix, true).await?;
        self.metrics.record_scan(snapshot.len());
        let objects_scanned = snapshot.len();

        let stale_attempts_pruned = if self.config.prune_stale_attempts {
            let present: HashSet<String> = snapshot.iter().map(|r| r.path.clone()).collect();
            let pruned = self.ledger.prune_missing(prefix, &present).await?;
            self.metrics.record_stale_attempts_pruned(pruned);
            pruned
        } else {
            0
        };

        self.set_state(PollerState::Filtering);
        let filtered = self.filter.apply(snapshot);
        let mut filtered_deleted = 0;
        for (record, reason) in &filtered.deletions {
            match self.store.delete(&record.path).await {
                Ok(_) => {
                    tracing::info!(path = %record.path, reason = %reason, "Deleted filtered object");
                    self.metrics.record_filtered_deletion();
                    filtered_deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %record.path, error = %e, "Failed to delete filtered object");
                }
            }
        }

        self.set_state(PollerState::Reconciling);
        let candidates = filtered.candidates.len();
        self.metrics.record_candidates(candidates);
        let reconciled = self.engine.reconcile(filtered.candidates).await?;

        self.set_state(PollerState::Processing);
        let processing = self
            .processor
            .process_all(reconciled.needs_processing)
            .await?;

        Ok(CycleReport {
            cycle_id,
            objects_scanned,
            ignored: filtered.ignored,
            filtered_deleted,
            stale_attempts_pruned,
            candidates,
            orphaned_deleted: reconciled.orphaned_deleted,
            failed_early_deleted: reconciled.failed_early_deleted,
            processing,
            duration_ms: 0,
        })
    }

    /// Spawn the loop. The interval is measured from the end of one cycle
    /// to the start of the next.
    pub fn start(self: Arc<Self>) -> PollerHandle {
        let poller = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        let join = tokio::spawn(async move {
            tracing::info!(
                scan_prefix = %poller.config.scan_prefix,
                poll_interval_ms = poller.config.poll_interval.as_millis() as u64,
                concurrency = poller.config.concurrency,
                retry_limit = poller.config.retry_limit,
                "Poller started"
            );

            let exit = loop {
                if *shutdown.borrow() {
                    break PollerExit::Stopped;
                }

                if let CycleOutcome::Halted = poller.tick().await {
                    break PollerExit::Stopped;
                }

                if poller.state() == PollerState::Stopped {
                    let failures = poller.consecutive_db_failures();
                    if failures >= poller.config.failure_threshold {
                        break PollerExit::CircuitOpen {
                            consecutive_failures: failures,
                        };
                    }
                    break PollerExit::Stopped;
                }

                tokio::select! {
                    _ = tokio::time::sleep(poller.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            };

            poller.set_state(PollerState::Stopped);
            poller.metrics.summary().log();
            tracing::info!(exit = ?exit, "Poller finished");
            exit
        });

        PollerHandle { poller: self, join }
    }

    /// Ask the loop to stop. A running cycle finishes first.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Clears the overlap flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a running poll loop.
pub struct PollerHandle {
    poller: Arc<Poller>,
    join: JoinHandle<PollerExit>,
}

impl PollerHandle {
    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn stop(&self) {
        self.poller.stop();
    }

    /// Wait for the loop to end. Must not be called again once it returned.
    pub async fn wait(&mut self) -> Result<PollerExit, tokio::task::JoinError> {
        (&mut self.join).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingFailure;
    use crate::owner::OwnerRecord;
    use async_trait::async_trait;
    use ntest::timeout;
    use object_store::memory::InMemory;

    struct NoopPipeline;

    #[async_trait]
    impl ProcessingPipeline for NoopPipeline {
        async fn process(&self, _: &str, _: &OwnerRecord) -> Result<(), ProcessingFailure> {
            Ok(())
        }
    }

    async fn poller(config: ReconcilerConfig) -> Arc<Poller> {
        let database = Database::new_in_memory().await.unwrap();
        database.create_downstream_tables().await.unwrap();
        let store = AudioStore::new(Arc::new(InMemory::new()));
        Arc::new(Poller::new(config, database, store, Arc::new(NoopPipeline)))
    }

    #[tokio::test]
    async fn test_empty_bucket_cycle_completes() {
        let poller = poller(ReconcilerConfig::default()).await;

        let CycleOutcome::Completed(report) = poller.tick().await else {
            panic!("cycle should complete");
        };
        assert_eq!(report.objects_scanned, 0);
        assert_eq!(report.candidates, 0);
        assert_eq!(poller.state(), PollerState::Idle);
        assert!(!poller.is_cycle_in_progress());
        assert_eq!(poller.metrics().reconciliation_queries(), 0);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_stop_ends_loop() {
        let poller = poller(ReconcilerConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        })
        .await;

        let mut handle = poller.clone().start();
        // let the first cycle run, then interrupt the sleep
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        assert_eq!(handle.wait().await.unwrap(), PollerExit::Stopped);
        assert_eq!(poller.state(), PollerState::Stopped);
        assert!(poller.metrics().cycles_completed() >= 1);
        assert!(matches!(poller.tick().await, CycleOutcome::Halted));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PollerState::Reconciling.to_string(), "reconciling");
        assert_eq!(PollerState::Stopped.to_string(), "stopped");
    }
}
