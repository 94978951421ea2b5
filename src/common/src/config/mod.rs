use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "intake.toml";

/// Prefix for environment variable overrides, e.g. `INTAKE__DATABASE__DSN`.
pub const ENV_PREFIX: &str = "INTAKE__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/intake.db"),
        }
    }
}

impl DatabaseConfig {
    /// In-memory SQLite, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Object storage holding the uploaded audio files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory://`, `file:///path` or `s3://[key:secret@]host[:port]/bucket`
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/uploads"),
        }
    }
}

/// Polling and retry behaviour of the reconciliation worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Prefix scanned every cycle. Objects are laid out as `{prefix}{owner}/{file}`.
    ///
    /// Env: INTAKE__RECONCILER__SCAN_PREFIX
    #[serde(default = "default_scan_prefix")]
    pub scan_prefix: String,

    /// File extensions (without dot, case-insensitive) that are fed to the pipeline.
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,

    /// Maximum number of objects processed in parallel within one cycle.
    ///
    /// Env: INTAKE__RECONCILER__CONCURRENCY
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause between the end of one cycle and the start of the next.
    ///
    /// Env: INTAKE__RECONCILER__POLL_INTERVAL (e.g. "60s")
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Pipeline invocations allowed per object before it is deleted.
    ///
    /// Env: INTAKE__RECONCILER__RETRY_LIMIT
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Consecutive cycles with a database error before the worker stops for good.
    ///
    /// Env: INTAKE__RECONCILER__FAILURE_THRESHOLD
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Drop attempt rows whose object is no longer in the bucket.
    #[serde(default = "default_prune_stale_attempts")]
    pub prune_stale_attempts: bool,
}

fn default_scan_prefix() -> String {
    "uploads/".to_string()
}

fn default_supported_extensions() -> Vec<String> {
    ["wav", "mp3", "m4a", "flac", "ogg", "webm", "mp4", "aac"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_limit() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_prune_stale_attempts() -> bool {
    true
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_prefix: default_scan_prefix(),
            supported_extensions: default_supported_extensions(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            retry_limit: default_retry_limit(),
            failure_threshold: default_failure_threshold(),
            prune_stale_attempts: default_prune_stale_attempts(),
        }
    }
}

impl ReconcilerConfig {
    /// Validate the reconciler configuration.
    ///
    /// Checks:
    /// - Scan prefix is not empty
    /// - At least one extension is supported
    /// - Concurrency, retry limit, failure threshold and poll interval are positive
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan_prefix.trim().is_empty() {
            anyhow::bail!("scan_prefix cannot be empty");
        }

        if self.supported_extensions.is_empty() {
            anyhow::bail!("supported_extensions must list at least one extension");
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be positive, got {}", self.concurrency);
        }

        if self.retry_limit == 0 {
            anyhow::bail!("retry_limit must be positive, got {}", self.retry_limit);
        }

        if self.failure_threshold == 0 {
            anyhow::bail!(
                "failure_threshold must be positive, got {}",
                self.failure_threshold
            );
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be positive");
        }

        Ok(())
    }

    /// True when `extension` (without dot) is one of the supported ones.
    pub fn supports_extension(&self, extension: &str) -> bool {
        self.supported_extensions
            .iter()
            .any(|supported| supported.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }
}

/// External processing pipeline invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Program run once per object as `command [args..] <object path> <owner identity>`.
    ///
    /// Env: INTAKE__PIPELINE__COMMAND
    #[serde(default = "default_pipeline_command")]
    pub command: String,

    /// Extra arguments placed before the object path.
    #[serde(default)]
    pub args: Vec<String>,

    /// Upper bound for a single invocation; expiry counts as a failed attempt.
    #[serde(default = "default_pipeline_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_pipeline_command() -> String {
    "intake-pipeline".to_string()
}

fn default_pipeline_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: default_pipeline_command(),
            args: Vec::new(),
            timeout: default_pipeline_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Database holding the retry ledger and the downstream records
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Object storage scanned for uploads
    #[serde(default)]
    pub storage: StorageConfig,
    /// Poll loop behaviour
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// External pipeline invocation
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    /// Load defaults, then `intake.toml`, then `INTAKE__*` environment variables.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Same as [`Configuration::load`] but with an explicit configuration file.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
