//! Candidate filtering on purely local signals.
//!
//! Rules, first match wins:
//! 1. Unsupported extension: ignored, left alone
//! 2. Marked `failed` by an earlier cycle: delete
//! 3. Legacy metadata retry counter at or above the retry limit: delete
//!
//! Everything else becomes a candidate for database reconciliation.

use std::fmt;

use common::config::ReconcilerConfig;

use crate::diagnostics::{is_marked_failed, legacy_retry_count};
use crate::store::ObjectRecord;

/// Why the filter wants an object gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// A previous permanent failure whose delete did not complete.
    MarkedFailed,
    /// Retries exhausted under the metadata-only retry scheme.
    LegacyRetriesExhausted,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanupReason::MarkedFailed => "marked_failed",
            CleanupReason::LegacyRetriesExhausted => "legacy_retries_exhausted",
        };
        write!(f, "{s}")
    }
}

/// Result of filtering one snapshot.
#[derive(Debug, Default)]
pub struct FilterResult {
    pub candidates: Vec<ObjectRecord>,
    pub deletions: Vec<(ObjectRecord, CleanupReason)>,
    pub ignored: usize,
}

#[derive(Debug, Clone)]
pub struct CandidateFilter {
    config: ReconcilerConfig,
}

impl CandidateFilter {
    pub fn new(config: &ReconcilerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn apply(&self, snapshot: Vec<ObjectRecord>) -> FilterResult {
        let mut result = FilterResult::default();

        for record in snapshot {
            let supported = record
                .extension()
                .is_some_and(|ext| self.config.supports_extension(&ext));
            if !supported {
                tracing::trace!(path = %record.path, "Ignoring unsupported file type");
                result.ignored += 1;
                continue;
            }

            if is_marked_failed(&record.metadata) {
                result.deletions.push((record, CleanupReason::MarkedFailed));
                continue;
            }

            let retry_limit = self.config.retry_limit;
            if legacy_retry_count(&record.metadata).is_some_and(|count| count >= retry_limit) {
                result
                    .deletions
                    .push((record, CleanupReason::LegacyRetriesExhausted));
                continue;
            }

            result.candidates.push(record);
        }

        result
    }
}
