//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig, StorageConfig};

/// Builder for creating test configurations.
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .in_memory()
///     .with_retry_limit(2)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// In-memory object store and SQLite database, short poll interval.
    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageConfig {
            dsn: "memory://".to_string(),
        };
        self.config.database = DatabaseConfig::in_memory();
        self.config.reconciler.poll_interval = Duration::from_millis(10);
        self
    }

    pub fn with_scan_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.reconciler.scan_prefix = prefix.into();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.config.reconciler.retry_limit = retry_limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.reconciler.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.reconciler.poll_interval = poll_interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.reconciler.failure_threshold = threshold;
        self
    }

    pub fn without_pruning(mut self) -> Self {
        self.config.reconciler.prune_stale_attempts = false;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}
