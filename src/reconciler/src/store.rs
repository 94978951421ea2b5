//! Object store access for uploaded recordings.
//!
//! Wraps an `object_store::ObjectStore` with the handful of operations the
//! worker needs. Advisory metadata is stored as object user metadata
//! (`Attribute::Metadata`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectMeta, ObjectStore, PutOptions,
    PutPayload,
};

/// Concurrent metadata lookups while building a snapshot.
const METADATA_FETCH_CONCURRENCY: usize = 16;

/// An uploaded object as seen by one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    /// Full path within the bucket, the join key for everything else.
    pub path: String,
    /// Advisory metadata. Never authoritative.
    pub metadata: HashMap<String, String>,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

impl ObjectRecord {
    fn from_meta(meta: ObjectMeta, metadata: HashMap<String, String>) -> Self {
        Self {
            path: meta.location.to_string(),
            metadata,
            last_modified: meta.last_modified,
            size: meta.size,
        }
    }

    /// File name without directories.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Lower-cased extension of the file name, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.file_name().rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    }
}

/// Stateless, cheaply cloneable client over the upload bucket.
#[derive(Clone)]
pub struct AudioStore {
    inner: Arc<dyn ObjectStore>,
}

impl AudioStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// Underlying store, for callers that need raw access (uploads in tests).
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    /// Complete listing of every object under `prefix`.
    ///
    /// Pagination is handled by the underlying store. With `include_metadata`
    /// each object's user metadata is fetched as well; an object deleted
    /// between listing and the metadata lookup is reported with empty metadata.
    pub async fn list(
        &self,
        prefix: &str,
        include_metadata: bool,
    ) -> Result<Vec<ObjectRecord>, object_store::Error> {
        let prefix_path = location(prefix)?;
        let metas: Vec<ObjectMeta> = self.inner.list(Some(&prefix_path)).try_collect().await?;

        tracing::debug!(prefix = %prefix, objects = metas.len(), "Listed upload prefix");

        if !include_metadata {
            return Ok(metas
                .into_iter()
                .map(|meta| ObjectRecord::from_meta(meta, HashMap::new()))
                .collect());
        }

        futures::stream::iter(metas)
            .map(|meta| async move {
                let metadata = self
                    .get_metadata(meta.location.as_ref())
                    .await?
                    .unwrap_or_default();
                Ok::<_, object_store::Error>(ObjectRecord::from_meta(meta, metadata))
            })
            .buffered(METADATA_FETCH_CONCURRENCY)
            .try_collect()
            .await
    }

    /// User metadata of `path`, `None` when the object does not exist.
    pub async fn get_metadata(
        &self,
        path: &str,
    ) -> Result<Option<HashMap<String, String>>, object_store::Error> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.inner.get_opts(&location(path)?, options).await {
            Ok(result) => Ok(Some(user_metadata(&result.attributes))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upsert `metadata` keys on `path`, keeping other keys.
    ///
    /// Object stores cannot edit metadata in place, so the whole object is
    /// downloaded, held in memory and uploaded again with the merged
    /// attributes. Each call costs a full read and a full write of the
    /// recording. Returns `false` when the object does not exist.
    pub async fn set_metadata(
        &self,
        path: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<bool, object_store::Error> {
        let location = location(path)?;
        let result = match self.inner.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut attributes = result.attributes.clone();
        let payload = result.bytes().await?;
        for (key, value) in metadata {
            attributes.insert(
                Attribute::Metadata(key.clone().into()),
                AttributeValue::from(value.clone()),
            );
        }

        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        self.inner
            .put_opts(&location, PutPayload::from(payload), options)
            .await?;
        Ok(true)
    }

    /// Delete `path`. Deleting an absent object is not an error.
    ///
    /// Returns `false` only when the store reports the object as missing.
    pub async fn delete(&self, path: &str) -> Result<bool, object_store::Error> {
        match self.inner.delete(&location(path)?).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, object_store::Error> {
        match self.inner.head(&location(path)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Store location of a listed path.
///
/// `Path::from` would percent-encode characters such as `%` or `#` and point
/// at a different key than the one the listing returned.
fn location(path: &str) -> Result<ObjectPath, object_store::Error> {
    Ok(ObjectPath::parse(path)?)
}

fn user_metadata(attributes: &Attributes) -> HashMap<String, String> {
    attributes
        .iter()
        .filter_map(|(key, value)| match key {
            Attribute::Metadata(name) => Some((name.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}
