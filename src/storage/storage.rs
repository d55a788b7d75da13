//! Nimbus Cloud Storage
//!
//! Object storage for one app. Objects live in an in-process, per-instance
//! store; references navigate paths inside the instance's bucket and run
//! their transfers on background tasks.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::app::App;
use crate::error::StorageError;
use crate::future::{FutureRegistry, LastResult};
use crate::storage::metadata::{Metadata, MetadataUpdate};
use crate::storage::reference::StorageReference;

/// Global map of "app|bucket" keys to Storage instances
static STORAGE_INSTANCES: Lazy<RwLock<HashMap<String, Storage>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

const DEFAULT_MAX_DOWNLOAD_RETRY_TIME: Duration = Duration::from_secs(600);
const DEFAULT_MAX_UPLOAD_RETRY_TIME: Duration = Duration::from_secs(600);
const DEFAULT_MAX_OPERATION_RETRY_TIME: Duration = Duration::from_secs(120);

/// Nimbus Cloud Storage instance
///
/// Each (app, bucket) pair has at most one Storage instance (singleton
/// pattern). Use [`Storage::get_instance`] for the app's default bucket or
/// [`Storage::get_instance_with_url`] for another one.
#[derive(Clone)]
pub struct Storage {
    pub(crate) inner: Arc<StorageInner>,
}

pub(crate) struct StorageInner {
    pub(crate) app_name: String,
    pub(crate) bucket: String,
    transfer_times: StdRwLock<TransferTimes>,
    quota_bytes: StdRwLock<Option<u64>>,
    objects: StdRwLock<HashMap<String, StoredObject>>,
    deleted: AtomicBool,
    pub(crate) futures: Arc<FutureRegistry>,
    pub(crate) last: StorageLastResults,
}

struct TransferTimes {
    download: Duration,
    upload: Duration,
    operation: Duration,
}

struct StoredObject {
    data: Vec<u8>,
    metadata: Metadata,
}

#[derive(Default)]
pub(crate) struct StorageLastResults {
    pub(crate) put_bytes: LastResult<Metadata>,
    pub(crate) get_bytes: LastResult<Vec<u8>>,
    pub(crate) get_metadata: LastResult<Metadata>,
    pub(crate) update_metadata: LastResult<Metadata>,
    pub(crate) delete_object: LastResult<()>,
}

impl Storage {
    /// Get or create the Storage instance for `app`'s default bucket
    pub async fn get_instance(app: &App) -> Result<Self, StorageError> {
        Self::for_bucket(app, app.storage_bucket()).await
    }

    /// Get or create the Storage instance for the bucket in a `gs://` URL
    ///
    /// The URL must name a bucket and nothing below it, e.g.
    /// `gs://my-bucket`.
    pub async fn get_instance_with_url(app: &App, url: &str) -> Result<Self, StorageError> {
        // Validate URL (error case first)
        let bucket = match url.strip_prefix("gs://") {
            None => return Err(StorageError::BucketNotFound),
            Some(rest) => rest.trim_end_matches('/'),
        };
        if bucket.is_empty() || bucket.contains('/') {
            return Err(StorageError::BucketNotFound);
        }
        Self::for_bucket(app, bucket.to_string()).await
    }

    async fn for_bucket(app: &App, bucket: String) -> Result<Self, StorageError> {
        // Validate bucket (error case first)
        if bucket.is_empty() {
            return Err(StorageError::BucketNotFound);
        }

        let key = format!("{}|{}", app.name(), bucket);
        let mut instances = STORAGE_INSTANCES.write().await;

        // Check if instance already exists
        if let Some(storage) = instances.get(&key) {
            return Ok(storage.clone());
        }

        let storage = Storage {
            inner: Arc::new(StorageInner {
                app_name: app.name().to_string(),
                bucket,
                transfer_times: StdRwLock::new(TransferTimes {
                    download: DEFAULT_MAX_DOWNLOAD_RETRY_TIME,
                    upload: DEFAULT_MAX_UPLOAD_RETRY_TIME,
                    operation: DEFAULT_MAX_OPERATION_RETRY_TIME,
                }),
                quota_bytes: StdRwLock::new(None),
                objects: StdRwLock::new(HashMap::new()),
                deleted: AtomicBool::new(false),
                futures: Arc::new(FutureRegistry::new()),
                last: StorageLastResults::default(),
            }),
        };

        debug!(app = %app.name(), bucket = %storage.inner.bucket, "created storage instance");
        instances.insert(key, storage.clone());

        Ok(storage)
    }

    /// Name of the app this instance belongs to
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Bucket this instance reads and writes
    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    /// `gs://` URL of this instance's bucket
    pub fn url(&self) -> String {
        format!("gs://{}", self.inner.bucket)
    }

    /// Reference to the bucket root
    pub fn reference(&self) -> StorageReference {
        StorageReference::new(Arc::clone(&self.inner), String::new())
    }

    /// Reference to `path` inside the bucket
    pub fn reference_from_path(&self, path: &str) -> StorageReference {
        self.reference().child(path)
    }

    /// Maximum time a download may spend before failing with the
    /// retry-limit-exceeded error
    pub fn max_download_retry_time(&self) -> Duration {
        self.inner.download_budget()
    }

    /// Set the maximum time downloads may take
    pub fn set_max_download_retry_time(&self, limit: Duration) {
        self.transfer_times_mut().download = limit;
    }

    /// Maximum time an upload may spend before failing with the
    /// retry-limit-exceeded error
    pub fn max_upload_retry_time(&self) -> Duration {
        self.inner.upload_budget()
    }

    /// Set the maximum time uploads may take
    pub fn set_max_upload_retry_time(&self, limit: Duration) {
        self.transfer_times_mut().upload = limit;
    }

    /// Maximum time a metadata operation may spend
    pub fn max_operation_retry_time(&self) -> Duration {
        self.inner.operation_budget()
    }

    /// Set the maximum time metadata operations may take
    pub fn set_max_operation_retry_time(&self, limit: Duration) {
        self.transfer_times_mut().operation = limit;
    }

    /// Cap the total bytes of object data this instance stores
    ///
    /// Uploads that would push the instance past the cap fail with the
    /// quota-exceeded error; `None` removes the cap. Existing objects are
    /// not evicted.
    pub fn set_quota(&self, limit: Option<u64>) {
        *self
            .inner
            .quota_bytes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = limit;
    }

    fn transfer_times_mut(&self) -> std::sync::RwLockWriteGuard<'_, TransferTimes> {
        self.inner
            .transfer_times
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("app_name", &self.inner.app_name)
            .field("bucket", &self.inner.bucket)
            .finish()
    }
}

/// Short name of an object, the last segment of its path
pub(crate) fn object_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

impl StorageInner {
    pub(crate) fn ensure_active(&self) -> Result<(), StorageError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(StorageError::Unknown);
        }
        Ok(())
    }

    pub(crate) fn download_budget(&self) -> Duration {
        self.transfer_times
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .download
    }

    pub(crate) fn upload_budget(&self) -> Duration {
        self.transfer_times
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upload
    }

    pub(crate) fn operation_budget(&self) -> Duration {
        self.transfer_times
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .operation
    }

    pub(crate) fn object_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|object| object.data.clone())
            .ok_or(StorageError::ObjectNotFound)
    }

    pub(crate) fn object_metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|object| object.metadata.clone())
            .ok_or(StorageError::ObjectNotFound)
    }

    /// Finalize an upload: enforce the quota, advance the generation and
    /// store the new object under `path`
    pub(crate) fn store_object(
        &self,
        path: &str,
        data: Vec<u8>,
        update: MetadataUpdate,
    ) -> Result<Metadata, StorageError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);

        // The quota covers object data only; metadata is free.
        if let Some(limit) = *self
            .quota_bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            let stored: u64 = objects.values().map(|o| o.data.len() as u64).sum();
            let replaced = objects.get(path).map_or(0, |o| o.data.len() as u64);
            if stored - replaced + data.len() as u64 > limit {
                return Err(StorageError::QuotaExceeded);
            }
        }

        let generation = objects.get(path).map_or(1, |o| o.metadata.generation + 1);
        let now = chrono::Utc::now();
        let metadata = Metadata {
            bucket: self.bucket.clone(),
            path: format!("/{}", path),
            name: object_name(path).to_string(),
            size_bytes: data.len() as u64,
            content_type: update.content_type,
            cache_control: update.cache_control,
            content_encoding: update.content_encoding,
            content_language: update.content_language,
            creation_time: now,
            updated_time: now,
            custom_metadata: update.custom_metadata.unwrap_or_default(),
            generation,
            metageneration: 1,
            download_token: Uuid::new_v4().to_string(),
        };
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );
        debug!(bucket = %self.bucket, path, generation, "stored object");
        Ok(metadata)
    }

    pub(crate) fn update_object_metadata(
        &self,
        path: &str,
        update: MetadataUpdate,
    ) -> Result<Metadata, StorageError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let object = objects.get_mut(path).ok_or(StorageError::ObjectNotFound)?;

        let metadata = &mut object.metadata;
        if let Some(content_type) = update.content_type {
            metadata.content_type = Some(content_type);
        }
        if let Some(cache_control) = update.cache_control {
            metadata.cache_control = Some(cache_control);
        }
        if let Some(content_encoding) = update.content_encoding {
            metadata.content_encoding = Some(content_encoding);
        }
        if let Some(content_language) = update.content_language {
            metadata.content_language = Some(content_language);
        }
        if let Some(custom_metadata) = update.custom_metadata {
            metadata.custom_metadata = custom_metadata;
        }
        metadata.metageneration += 1;
        metadata.updated_time = chrono::Utc::now();
        Ok(metadata.clone())
    }

    pub(crate) fn remove_object(&self, path: &str) -> Result<(), StorageError> {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        match removed {
            Some(_) => {
                debug!(bucket = %self.bucket, path, "deleted object");
                Ok(())
            }
            None => Err(StorageError::ObjectNotFound),
        }
    }
}

/// Tear down every Storage instance created for `app_name`
///
/// Called by [`App::delete_app`](crate::App::delete_app). Stored objects are
/// dropped and operations issued afterwards fail.
pub(crate) async fn purge_instance(app_name: &str) {
    let mut instances = STORAGE_INSTANCES.write().await;
    let keys: Vec<String> = instances
        .keys()
        .filter(|key| key.split('|').next() == Some(app_name))
        .cloned()
        .collect();

    let mut removed = Vec::new();
    for key in keys {
        if let Some(storage) = instances.remove(&key) {
            removed.push(storage);
        }
    }
    drop(instances);

    for storage in removed {
        storage.inner.deleted.store(true, Ordering::SeqCst);
        storage
            .inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!(app = %app_name, bucket = %storage.inner.bucket, "purged storage instance");
    }
}
