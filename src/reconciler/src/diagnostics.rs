//! Advisory object metadata.
//!
//! Everything written here is for humans inspecting the bucket. Control flow
//! never reads it back, with one exception: the candidate filter honours the
//! `failed` status and the pre-ledger `retry_count` key (see [`crate::filter`]).
//! The attempt count is written under `attempt_count` so nothing written here
//! ever feeds the legacy counter.

use std::collections::HashMap;

use chrono::Utc;

use crate::error::truncate_message;
use crate::store::AudioStore;

pub const STATUS_KEY: &str = "status";
pub const ATTEMPT_COUNT_KEY: &str = "attempt_count";
/// Counter of the metadata-only retry scheme. Read, never written.
pub const LEGACY_RETRY_COUNT_KEY: &str = "retry_count";
pub const LAST_ERROR_KEY: &str = "last_error";
pub const UPDATED_AT_KEY: &str = "updated_at";

pub const STATUS_PROCESSED: &str = "processed";
pub const STATUS_RETRYING: &str = "retrying";
pub const STATUS_FAILED: &str = "failed";

/// Longest error text stored in object metadata.
pub const MAX_METADATA_ERROR_CHARS: usize = 256;

/// Best-effort diagnostics writer. Failures are logged and swallowed.
#[derive(Clone)]
pub struct Diagnostics {
    store: AudioStore,
}

impl Diagnostics {
    pub fn new(store: AudioStore) -> Self {
        Self { store }
    }

    pub async fn mark_processed(&self, path: &str) {
        self.write(path, status_metadata(STATUS_PROCESSED)).await;
    }

    pub async fn mark_retrying(&self, path: &str, attempts: u32, error: &str) {
        let mut metadata = status_metadata(STATUS_RETRYING);
        metadata.insert(ATTEMPT_COUNT_KEY.to_string(), attempts.to_string());
        metadata.insert(
            LAST_ERROR_KEY.to_string(),
            truncate_message(error, MAX_METADATA_ERROR_CHARS),
        );
        self.write(path, metadata).await;
    }

    pub async fn mark_failed(&self, path: &str, attempts: u32, error: &str) {
        let mut metadata = status_metadata(STATUS_FAILED);
        metadata.insert(ATTEMPT_COUNT_KEY.to_string(), attempts.to_string());
        metadata.insert(
            LAST_ERROR_KEY.to_string(),
            truncate_message(error, MAX_METADATA_ERROR_CHARS),
        );
        self.write(path, metadata).await;
    }

    async fn write(&self, path: &str, metadata: HashMap<String, String>) {
        match self.store.set_metadata(path, &metadata).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(path = %path, "Object vanished before diagnostics write");
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to write diagnostics metadata");
            }
        }
    }
}

fn status_metadata(status: &str) -> HashMap<String, String> {
    HashMap::from([
        (STATUS_KEY.to_string(), status.to_string()),
        (UPDATED_AT_KEY.to_string(), Utc::now().to_rfc3339()),
    ])
}

/// True when a previous cycle marked the object as permanently failed.
pub fn is_marked_failed(metadata: &HashMap<String, String>) -> bool {
    metadata
        .get(STATUS_KEY)
        .is_some_and(|status| status.eq_ignore_ascii_case(STATUS_FAILED))
}

/// Retry counter written by the metadata-only retry mechanism that predates the ledger.
pub fn legacy_retry_count(metadata: &HashMap<String, String>) -> Option<u32> {
    metadata.get(LEGACY_RETRY_COUNT_KEY)?.trim().parse().ok()
}
