//! Upload bucket location.
//!
//! The storage DSN is parsed once into an [`UploadLocation`]. Validation,
//! `intake config` and the worker all go through it, so a bad DSN is reported
//! before any connection is attempted.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use url::Url;

use crate::config::StorageConfig;

/// Where uploaded recordings live.
#[derive(Clone, PartialEq, Eq)]
pub enum UploadLocation {
    /// Process-local bucket, lost on restart.
    Memory,
    /// Directory on the local filesystem.
    Directory(PathBuf),
    /// S3 or an S3-compatible server (MinIO, R2, ...).
    S3 {
        bucket: String,
        /// `None` for AWS proper.
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
    },
}

impl UploadLocation {
    /// Parse `memory://`, `file:///path` or `s3://[key:secret@]host[:port]/bucket`.
    ///
    /// `file:///.data/uploads` (a path starting with `/.`) is relative to the
    /// working directory.
    pub fn parse(dsn: &str) -> Result<Self> {
        let url = Url::parse(dsn).with_context(|| format!("Invalid storage DSN '{dsn}'"))?;

        match url.scheme() {
            "memory" => Ok(Self::Memory),
            "file" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    anyhow::bail!("File DSN must name the upload directory: file:///path/to/uploads");
                }
                let path = path.strip_prefix('/').filter(|p| p.starts_with('.')).unwrap_or(path);
                Ok(Self::Directory(PathBuf::from(path)))
            }
            "s3" => Self::parse_s3(&url),
            scheme => anyhow::bail!(
                "Unsupported storage scheme '{scheme}' (expected memory, file or s3)"
            ),
        }
    }

    fn parse_s3(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .context("S3 DSN must name a host: s3://host/bucket")?;
        let bucket = url.path().trim_matches('/');
        if bucket.is_empty() {
            anyhow::bail!("S3 DSN must name the upload bucket: s3://host/bucket");
        }
        if bucket.contains('/') {
            anyhow::bail!(
                "S3 DSN names '{bucket}', use reconciler.scan_prefix for paths inside the bucket"
            );
        }

        let endpoint = (!host.ends_with("amazonaws.com")).then(|| {
            let scheme = if url.port() == Some(443) { "https" } else { "http" };
            match url.port() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            }
        });
        let access_key = Some(url.username())
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        Ok(Self::S3 {
            bucket: bucket.to_string(),
            endpoint,
            secret_key: access_key
                .as_ref()
                .and(url.password())
                .map(str::to_string),
            access_key,
        })
    }

    /// Open the bucket. A missing upload directory is created.
    pub fn open(&self) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self {
            Self::Memory => {
                log::warn!("Using in-memory upload store, uploads will not survive a restart");
                Arc::new(InMemory::new())
            }
            Self::Directory(path) => {
                std::fs::create_dir_all(path).with_context(|| {
                    format!("Failed to create upload directory {}", path.display())
                })?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            Self::S3 {
                bucket,
                endpoint,
                access_key,
                secret_key,
            } => {
                // AWS_* variables first, DSN values win
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(true)
                        .with_virtual_hosted_style_request(false);
                }
                if let Some(key) = access_key {
                    builder = builder.with_access_key_id(key);
                }
                if let Some(secret) = secret_key {
                    builder = builder.with_secret_access_key(secret);
                }
                Arc::new(builder.build()?)
            }
        };

        log::info!("Upload store: {self}");
        Ok(store)
    }
}

/// Never prints the secret key.
impl fmt::Display for UploadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "in-memory bucket"),
            Self::Directory(path) => write!(f, "directory {}", path.display()),
            Self::S3 {
                bucket,
                endpoint,
                access_key,
                ..
            } => {
                write!(f, "s3 bucket '{bucket}'")?;
                if let Some(endpoint) = endpoint {
                    write!(f, " at {endpoint}")?;
                }
                match access_key {
                    Some(key) => write!(f, " (access key {key})"),
                    None => write!(f, " (credentials from environment)"),
                }
            }
        }
    }
}

impl fmt::Debug for UploadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadLocation({self})")
    }
}

/// Open the upload bucket named by the storage configuration.
pub fn create_object_store(storage_config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    UploadLocation::parse(&storage_config.dsn)?.open()
}
