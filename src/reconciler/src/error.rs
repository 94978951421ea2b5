use std::time::Duration;

/// Errors that escape a component boundary.
///
/// Only [`ReconcileError::Database`] is allowed to abort the worker pool and
/// count against the circuit breaker. Store errors abort at most the current
/// cycle (scan failures) and are otherwise logged where they happen.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
}

impl ReconcileError {
    /// True for errors that must escalate to the circuit breaker.
    pub fn is_database(&self) -> bool {
        matches!(self, ReconcileError::Database(_))
    }
}

/// Why a single object could not be processed.
///
/// These never leave the task that produced them; they are recorded in the
/// retry ledger instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingFailure {
    #[error("cannot derive owner identity from path '{0}'")]
    UnparseableIdentity(String),

    #[error("owner '{0}' not found")]
    OwnerNotFound(String),

    #[error("pipeline failed during {stage}: {message}")]
    Pipeline { stage: String, message: String },

    #[error("pipeline did not finish within {0:?}")]
    Timeout(Duration),
}

impl ProcessingFailure {
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessingFailure::Pipeline {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Cut `message` to at most `max_chars` characters, marking the cut.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_are_classified() {
        let err = ReconcileError::from(sqlx::Error::PoolClosed);
        assert!(err.is_database());

        let err = ReconcileError::from(object_store::Error::NotImplemented);
        assert!(!err.is_database());
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdefghij", 10), "abcdefghij");
        assert_eq!(truncate_message("abcdefghijk", 10), "abcdefg...");
        // multi-byte characters are not split
        assert_eq!(truncate_message("ééééé", 4), "é...");
    }

    #[test]
    fn test_processing_failure_display() {
        let failure = ProcessingFailure::pipeline("transcription", "model crashed");
        assert_eq!(
            failure.to_string(),
            "pipeline failed during transcription: model crashed"
        );
        assert_eq!(
            ProcessingFailure::OwnerNotFound("alice".to_string()).to_string(),
            "owner 'alice' not found"
        );
    }
}
