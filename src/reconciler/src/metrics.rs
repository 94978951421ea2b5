//! Reconciler metrics tracking
//!
//! Thread-safe counters shared by every component of the poll loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Thread-safe metrics for the reconciliation worker
#[derive(Debug, Clone, Default)]
pub struct ReconcilerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    cycles_completed: AtomicUsize,
    cycles_failed: AtomicUsize,
    cycles_skipped: AtomicUsize,
    database_failures: AtomicUsize,
    circuit_trips: AtomicUsize,
    objects_scanned: AtomicUsize,
    candidates_found: AtomicUsize,
    candidates_processed: AtomicUsize,
    filtered_deletions: AtomicUsize,
    orphaned_successes: AtomicUsize,
    failed_early: AtomicUsize,
    retries_scheduled: AtomicUsize,
    permanent_failures: AtomicUsize,
    pipeline_invocations: AtomicUsize,
    reconciliation_queries: AtomicUsize,
    stale_attempts_pruned: AtomicU64,
    total_duration_ms: AtomicU64,
    last_duration_ms: AtomicU64,
}

impl ReconcilerMetrics {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cycle that ran to the end
    pub fn record_cycle_completed(&self, duration: Duration) {
        self.inner.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
    }

    /// Record a cycle aborted by an error
    pub fn record_cycle_failed(&self, duration: Duration, database: bool) {
        self.inner.cycles_failed.fetch_add(1, Ordering::Relaxed);
        if database {
            self.inner.database_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.record_duration(duration);
    }

    fn record_duration(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.inner
            .total_duration_ms
            .fetch_add(ms, Ordering::Relaxed);
        self.inner.last_duration_ms.store(ms, Ordering::Relaxed);
    }

    /// Record a tick that found the previous cycle still running
    pub fn record_cycle_skipped(&self) {
        self.inner.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_trip(&self) {
        self.inner.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self, objects: usize) {
        self.inner
            .objects_scanned
            .fetch_add(objects, Ordering::Relaxed);
    }

    pub fn record_candidates(&self, candidates: usize) {
        self.inner
            .candidates_found
            .fetch_add(candidates, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.inner
            .candidates_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered_deletion(&self) {
        self.inner
            .filtered_deletions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphaned_success(&self) {
        self.inner
            .orphaned_successes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_early(&self) {
        self.inner.failed_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_scheduled(&self) {
        self.inner.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.inner
            .permanent_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_invocation(&self) {
        self.inner
            .pipeline_invocations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation_query(&self) {
        self.inner
            .reconciliation_queries
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_attempts_pruned(&self, rows: u64) {
        self.inner
            .stale_attempts_pruned
            .fetch_add(rows, Ordering::Relaxed);
    }

    pub fn cycles_completed(&self) -> usize {
        self.inner.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> usize {
        self.inner.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn cycles_skipped(&self) -> usize {
        self.inner.cycles_skipped.load(Ordering::Relaxed)
    }

    pub fn database_failures(&self) -> usize {
        self.inner.database_failures.load(Ordering::Relaxed)
    }

    pub fn circuit_trips(&self) -> usize {
        self.inner.circuit_trips.load(Ordering::Relaxed)
    }

    pub fn candidates_found(&self) -> usize {
        self.inner.candidates_found.load(Ordering::Relaxed)
    }

    pub fn candidates_processed(&self) -> usize {
        self.inner.candidates_processed.load(Ordering::Relaxed)
    }

    pub fn pipeline_invocations(&self) -> usize {
        self.inner.pipeline_invocations.load(Ordering::Relaxed)
    }

    /// Batched queries issued by the reconciliation engine
    pub fn reconciliation_queries(&self) -> usize {
        self.inner.reconciliation_queries.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    pub fn summary(&self) -> MetricsSummary {
        let inner = &self.inner;
        MetricsSummary {
            cycles_completed: inner.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: inner.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: inner.cycles_skipped.load(Ordering::Relaxed),
            database_failures: inner.database_failures.load(Ordering::Relaxed),
            circuit_trips: inner.circuit_trips.load(Ordering::Relaxed),
            objects_scanned: inner.objects_scanned.load(Ordering::Relaxed),
            candidates_found: inner.candidates_found.load(Ordering::Relaxed),
            candidates_processed: inner.candidates_processed.load(Ordering::Relaxed),
            filtered_deletions: inner.filtered_deletions.load(Ordering::Relaxed),
            orphaned_successes: inner.orphaned_successes.load(Ordering::Relaxed),
            failed_early: inner.failed_early.load(Ordering::Relaxed),
            retries_scheduled: inner.retries_scheduled.load(Ordering::Relaxed),
            permanent_failures: inner.permanent_failures.load(Ordering::Relaxed),
            pipeline_invocations: inner.pipeline_invocations.load(Ordering::Relaxed),
            reconciliation_queries: inner.reconciliation_queries.load(Ordering::Relaxed),
            stale_attempts_pruned: inner.stale_attempts_pruned.load(Ordering::Relaxed),
            total_duration_ms: inner.total_duration_ms.load(Ordering::Relaxed),
            last_duration_ms: inner.last_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciler metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub cycles_completed: usize,
    pub cycles_failed: usize,
    pub cycles_skipped: usize,
    pub database_failures: usize,
    pub circuit_trips: usize,
    pub objects_scanned: usize,
    pub candidates_found: usize,
    pub candidates_processed: usize,
    pub filtered_deletions: usize,
    pub orphaned_successes: usize,
    pub failed_early: usize,
    pub retries_scheduled: usize,
    pub permanent_failures: usize,
    pub pipeline_invocations: usize,
    pub reconciliation_queries: usize,
    pub stale_attempts_pruned: u64,
    pub total_duration_ms: u64,
    pub last_duration_ms: u64,
}

impl MetricsSummary {
    /// Log the summary
    pub fn log(&self) {
        tracing::info!(
            cycles_completed = self.cycles_completed,
            cycles_failed = self.cycles_failed,
            cycles_skipped = self.cycles_skipped,
            database_failures = self.database_failures,
            candidates_found = self.candidates_found,
            candidates_processed = self.candidates_processed,
            orphaned_successes = self.orphaned_successes,
            failed_early = self.failed_early,
            filtered_deletions = self.filtered_deletions,
            retries_scheduled = self.retries_scheduled,
            permanent_failures = self.permanent_failures,
            pipeline_invocations = self.pipeline_invocations,
            stale_attempts_pruned = self.stale_attempts_pruned,
            "Reconciler metrics summary"
        );
    }
}
