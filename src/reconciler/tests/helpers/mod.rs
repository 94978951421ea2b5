//! Shared fixtures for the reconciler integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::Database;
use common::config::ReconcilerConfig;
use common::testing::TestConfigBuilder;
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use reconciler::{AudioStore, OwnerRecord, Poller, ProcessingFailure, ProcessingPipeline};

/// In-memory store whose listing can be made to fail.
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemory,
    fail_listing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemory::new(),
            fail_listing: AtomicBool::new(false),
        }
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return futures::stream::once(async {
                Err(object_store::Error::Generic {
                    store: "FlakyStore",
                    source: "listing unavailable".into(),
                })
            })
            .boxed();
        }
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Pipeline double that records calls and writes the job record on success,
/// as the real pipeline does.
pub struct ScriptedPipeline {
    database: Database,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl ScriptedPipeline {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            failing: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ProcessingPipeline for ScriptedPipeline {
    async fn process(&self, path: &str, _owner: &OwnerRecord) -> Result<(), ProcessingFailure> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fails = self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(path);
        if fails {
            return Err(ProcessingFailure::pipeline("transcription", "decoder error"));
        }

        let Database::Sqlite(pool) = &self.database else {
            unreachable!("tests run on sqlite")
        };
        sqlx::query("INSERT INTO jobs (recording_id, source_path) VALUES (NULL, ?)")
            .bind(path)
            .execute(pool)
            .await
            .map_err(|e| ProcessingFailure::pipeline("persist", e.to_string()))?;
        Ok(())
    }
}

pub struct Harness {
    pub database: Database,
    pub raw_store: Arc<FlakyStore>,
    pub store: AudioStore,
    pub pipeline: Arc<ScriptedPipeline>,
    pub poller: Arc<Poller>,
}

pub fn config() -> TestConfigBuilder {
    TestConfigBuilder::new().in_memory()
}

impl Harness {
    pub async fn new(config: ReconcilerConfig) -> Self {
        let database = Database::new_in_memory()
            .await
            .expect("Failed to create in-memory database");
        database
            .create_downstream_tables()
            .await
            .expect("Failed to create downstream tables");

        let harness_db = database.clone();
        let raw_store = Arc::new(FlakyStore::new());
        let store = AudioStore::new(raw_store.clone());
        let pipeline = Arc::new(ScriptedPipeline::new(database.clone()));
        let poller = Arc::new(Poller::new(
            config,
            database,
            store.clone(),
            pipeline.clone(),
        ));

        let harness = Self {
            database: harness_db,
            raw_store,
            store,
            pipeline,
            poller,
        };
        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
            harness
                .execute(&format!(
                    "INSERT INTO users (id, username) VALUES ({id}, '{name}')"
                ))
                .await;
        }
        harness
    }

    pub async fn execute(&self, sql: &str) {
        let Database::Sqlite(pool) = &self.database else {
            unreachable!("tests run on sqlite")
        };
        sqlx::query(sql).execute(pool).await.unwrap();
    }

    pub async fn count(&self, sql: &str) -> i64 {
        let Database::Sqlite(pool) = &self.database else {
            unreachable!("tests run on sqlite")
        };
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    pub async fn upload(&self, path: &str) {
        self.raw_store
            .put(&ObjectPath::parse(path).unwrap(), PutPayload::from_static(b"RIFF"))
            .await
            .unwrap();
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.store.exists(path).await.unwrap()
    }

    /// Paths currently in the bucket, as the raw store lists them.
    pub async fn remaining_objects(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .raw_store
            .list(None)
            .map(|meta| meta.unwrap().location.to_string())
            .collect()
            .await;
        paths.sort();
        paths
    }

    pub async fn attempt_rows(&self) -> i64 {
        self.count("SELECT COUNT(*) FROM processing_attempts").await
    }

    /// Make every reconciliation query fail.
    pub async fn break_database(&self) {
        self.execute("DROP TABLE jobs").await;
    }

    pub async fn repair_database(&self) {
        self.database.create_downstream_tables().await.unwrap();
    }
}
