//! Durable blob storage for event logs and artifacts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::config::to_delta;
use crate::error::ObjectStorageError;

/// Result type for object storage operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectStorageError>;

/// Key of the durable JSON-lines event log for a sandbox.
pub fn event_log_key(sandbox_id: &str) -> String {
    format!("events/{sandbox_id}.jsonl")
}

/// Key of the durable JSON-lines output log of one exec.
pub fn exec_log_key(sandbox_id: &str, exec_id: &str) -> String {
    format!("execs/{sandbox_id}/{exec_id}.jsonl")
}

/// A blob store with presigned reads.
#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    /// Write an object, replacing any existing one.
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> ObjectResult<()>;

    /// Read an object.
    async fn get_object(&self, key: &str) -> ObjectResult<Vec<u8>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> ObjectResult<()>;

    /// A URL that allows reading `key` for `ttl`.
    async fn get_presigned_url(&self, key: &str, ttl: Duration) -> ObjectResult<String>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// In-memory [`ObjectStorage`] that counts deletes.
#[derive(Debug)]
pub struct InMemoryObjectStorage {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    deletes: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("clam", Arc::new(SystemClock))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> ObjectStorageError {
    ObjectStorageError::Backend("lock poisoned".to_string())
}

impl InMemoryObjectStorage {
    /// Creates an empty bucket.
    #[must_use]
    pub fn new(bucket: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            deletes: AtomicUsize::new(0),
            clock,
        }
    }

    /// Whether an object exists at `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Content type recorded for `key`.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|object| object.content_type.clone())
    }

    /// How many deletes have been issued, including deletes of missing keys.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> ObjectResult<()> {
        self.objects.write().map_err(poison_err)?.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ObjectResult<Vec<u8>> {
        self.objects
            .read()
            .map_err(poison_err)?
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| ObjectStorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.write().map_err(poison_err)?.remove(key);
        Ok(())
    }

    async fn get_presigned_url(&self, key: &str, ttl: Duration) -> ObjectResult<String> {
        let expires = self.clock.now() + to_delta(ttl);
        Ok(format!(
            "memory://{}/{key}?expires={}",
            self.bucket,
            expires.timestamp()
        ))
    }
}
