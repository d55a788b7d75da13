//! Object handles: navigation plus the transfer and metadata surface

use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::future::Future;
use crate::storage::controller::Controller;
use crate::storage::listener::StorageListener;
use crate::storage::metadata::{Metadata, MetadataUpdate};
use crate::storage::storage::{object_name, Storage, StorageInner};

/// Transfers move in chunks of this many bytes; progress is reported and
/// cancellation observed at chunk boundaries.
const TRANSFER_CHUNK_BYTES: u64 = 256 * 1024;

/// A location in a storage bucket
///
/// References are cheap to clone and navigate; no data moves until an
/// operation is called. Uploads and downloads return a [`Future`] together
/// with a [`Controller`] for progress and cancellation.
///
/// # Example
///
/// ```no_run
/// # async fn example(storage: nimbus_sdk::storage::Storage) {
/// let photo = storage.reference().child("images/photo.png");
/// let (upload, _controller) = photo.put_bytes(vec![1, 2, 3]);
/// let metadata = upload.await.unwrap();
/// assert_eq!(metadata.size_bytes, 3);
/// # }
/// ```
#[derive(Clone)]
pub struct StorageReference {
    inner: Arc<StorageInner>,
    /// Normalized slash-separated object path; empty for the bucket root
    path: String,
}

impl StorageReference {
    pub(crate) fn new(inner: Arc<StorageInner>, path: String) -> Self {
        StorageReference { inner, path }
    }

    /// The storage instance this reference belongs to
    pub fn storage(&self) -> Storage {
        Storage {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Bucket this reference points into
    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    /// Absolute slash-separated path of this object
    pub fn path(&self) -> String {
        format!("/{}", self.path)
    }

    /// Short name of this object (the last path segment), empty at the root
    pub fn name(&self) -> &str {
        object_name(&self.path)
    }

    /// Whether this reference points at the bucket root
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// A reference to a location below this one
    ///
    /// `path` may span several segments (`"images/photo.png"`); empty
    /// segments are dropped.
    pub fn child(&self, path: &str) -> StorageReference {
        StorageReference {
            inner: Arc::clone(&self.inner),
            path: join_path(&self.path, path),
        }
    }

    /// The parent location, or `None` at the root
    pub fn parent(&self) -> Option<StorageReference> {
        if self.path.is_empty() {
            return None;
        }
        let parent = match self.path.rsplit_once('/') {
            Some((rest, _)) => rest.to_string(),
            None => String::new(),
        };
        Some(StorageReference {
            inner: Arc::clone(&self.inner),
            path: parent,
        })
    }

    /// A reference to the bucket root
    pub fn root(&self) -> StorageReference {
        StorageReference {
            inner: Arc::clone(&self.inner),
            path: String::new(),
        }
    }

    /// Upload `data` to this location
    pub fn put_bytes(&self, data: Vec<u8>) -> (Future<Metadata>, Controller) {
        self.put_bytes_with(data, MetadataUpdate::default(), None)
    }

    /// Upload `data` with initial metadata and an optional progress listener
    ///
    /// Overwriting an existing object starts a new generation; its metadata
    /// is rebuilt from `metadata` rather than merged with the old one.
    pub fn put_bytes_with(
        &self,
        data: Vec<u8>,
        metadata: MetadataUpdate,
        listener: Option<Arc<dyn StorageListener>>,
    ) -> (Future<Metadata>, Controller) {
        let controller = Controller::new(data.len() as u64);
        let future = self.inner.futures.alloc::<Metadata>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        let worker_controller = controller.clone();
        tokio::spawn(async move {
            let outcome = run_upload(
                &inner,
                &path,
                data,
                metadata,
                listener.as_deref(),
                &worker_controller,
            )
            .await;
            match outcome {
                Ok(stored) => registry.complete(handle, stored),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.put_bytes.set(&future);
        (future, controller)
    }

    /// Download the object at this location
    ///
    /// Fails with the download-size-exceeded error when the object is larger
    /// than `max_size` bytes; nothing is transferred in that case.
    pub fn get_bytes(&self, max_size: u64) -> (Future<Vec<u8>>, Controller) {
        self.get_bytes_with(max_size, None)
    }

    /// [`get_bytes`](Self::get_bytes) with a progress listener
    pub fn get_bytes_with(
        &self,
        max_size: u64,
        listener: Option<Arc<dyn StorageListener>>,
    ) -> (Future<Vec<u8>>, Controller) {
        // Total size is unknown until the worker resolves the object.
        let controller = Controller::new(0);
        let future = self.inner.futures.alloc::<Vec<u8>>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        let worker_controller = controller.clone();
        tokio::spawn(async move {
            let outcome = run_download(
                &inner,
                &path,
                max_size,
                listener.as_deref(),
                &worker_controller,
            )
            .await;
            match outcome {
                Ok(bytes) => registry.complete(handle, bytes),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.get_bytes.set(&future);
        (future, controller)
    }

    /// Read the metadata of the object at this location
    pub fn get_metadata(&self) -> Future<Metadata> {
        let future = self.inner.futures.alloc::<Metadata>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        tokio::spawn(async move {
            let outcome = bounded(inner.operation_budget(), async {
                inner.ensure_active()?;
                inner.object_metadata(&path)
            })
            .await;
            match outcome {
                Ok(metadata) => registry.complete(handle, metadata),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.get_metadata.set(&future);
        future
    }

    /// Change the writable metadata of the object at this location
    ///
    /// `None` fields stay as they are; the object data and generation do not
    /// change. Resolves with the updated metadata.
    pub fn update_metadata(&self, update: MetadataUpdate) -> Future<Metadata> {
        let future = self.inner.futures.alloc::<Metadata>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        tokio::spawn(async move {
            let outcome = bounded(inner.operation_budget(), async {
                inner.ensure_active()?;
                inner.update_object_metadata(&path, update)
            })
            .await;
            match outcome {
                Ok(metadata) => registry.complete(handle, metadata),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.update_metadata.set(&future);
        future
    }

    /// Delete the object at this location
    pub fn delete_object(&self) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        tokio::spawn(async move {
            let outcome = bounded(inner.operation_budget(), async {
                inner.ensure_active()?;
                inner.remove_object(&path)
            })
            .await;
            match outcome {
                Ok(()) => registry.complete(handle, ()),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.delete_object.set(&future);
        future
    }

    /// Future of the most recent upload made through this storage instance
    pub fn put_bytes_last_result(&self) -> Future<Metadata> {
        self.inner.last.put_bytes.get()
    }

    /// Future of the most recent download
    pub fn get_bytes_last_result(&self) -> Future<Vec<u8>> {
        self.inner.last.get_bytes.get()
    }

    /// Future of the most recent [`get_metadata`](Self::get_metadata) call
    pub fn get_metadata_last_result(&self) -> Future<Metadata> {
        self.inner.last.get_metadata.get()
    }

    /// Future of the most recent [`update_metadata`](Self::update_metadata)
    /// call
    pub fn update_metadata_last_result(&self) -> Future<Metadata> {
        self.inner.last.update_metadata.get()
    }

    /// Future of the most recent [`delete_object`](Self::delete_object) call
    pub fn delete_object_last_result(&self) -> Future<()> {
        self.inner.last.delete_object.get()
    }
}

impl PartialEq for StorageReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.path == other.path
    }
}

impl std::fmt::Debug for StorageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReference")
            .field("bucket", &self.inner.bucket)
            .field("path", &self.path())
            .finish()
    }
}

fn join_path(base: &str, child: &str) -> String {
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    segments.extend(child.split('/').filter(|s| !s.is_empty()));
    segments.join("/")
}

async fn run_upload(
    inner: &StorageInner,
    path: &str,
    data: Vec<u8>,
    metadata: MetadataUpdate,
    listener: Option<&dyn StorageListener>,
    controller: &Controller,
) -> Result<Metadata, StorageError> {
    inner.ensure_active()?;
    // Data must land under an object name, never the bucket itself.
    if path.is_empty() {
        return Err(StorageError::Unknown);
    }
    transfer(
        inner.upload_budget(),
        data.len() as u64,
        listener,
        controller,
    )
    .await?;
    // A cancel racing the final chunk still wins over finalization.
    if controller.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    inner.store_object(path, data, metadata)
}

async fn run_download(
    inner: &StorageInner,
    path: &str,
    max_size: u64,
    listener: Option<&dyn StorageListener>,
    controller: &Controller,
) -> Result<Vec<u8>, StorageError> {
    inner.ensure_active()?;
    if path.is_empty() {
        return Err(StorageError::ObjectNotFound);
    }
    let bytes = inner.object_bytes(path)?;
    let total = bytes.len() as u64;
    if total > max_size {
        return Err(StorageError::DownloadSizeExceeded);
    }
    controller.set_total(total);
    transfer(inner.download_budget(), total, listener, controller).await?;
    if controller.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(bytes)
}

/// Drive the chunk loop, reporting progress at every boundary
async fn transfer(
    budget: Duration,
    total: u64,
    listener: Option<&dyn StorageListener>,
    controller: &Controller,
) -> Result<(), StorageError> {
    bounded(budget, async {
        if let Some(listener) = listener {
            listener.on_progress(controller);
        }
        let mut moved = 0u64;
        while moved < total {
            if controller.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let step = TRANSFER_CHUNK_BYTES.min(total - moved);
            moved += step;
            controller.advance(step);
            if let Some(listener) = listener {
                listener.on_progress(controller);
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    })
    .await
}

/// Cap `op` at `budget`, converting overrun into the retry-limit error
async fn bounded<T>(
    budget: Duration,
    op: impl std::future::Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    match tokio::time::timeout(budget, op).await {
        Ok(outcome) => outcome,
        Err(_) => Err(StorageError::RetryLimitExceeded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppOptions};
    use crate::future::FutureStatus;
    use crate::storage::storage::Storage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    async fn test_storage(name: &str) -> Storage {
        let app = App::create(AppOptions {
            api_key: format!("api-key-{}", name),
            project_id: format!("project-{}", name),
            app_name: Some(name.to_string()),
            ..Default::default()
        })
        .await
        .expect("Failed to create app");
        Storage::get_instance(&app)
            .await
            .expect("Failed to create storage")
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<(u64, u64)>>,
    }

    impl StorageListener for RecordingListener {
        fn on_progress(&self, controller: &Controller) {
            self.seen
                .lock()
                .unwrap()
                .push((controller.bytes_transferred(), controller.total_byte_count()));
        }
    }

    /// Cancels its own transfer as soon as any bytes have moved
    struct CancellingListener;

    impl StorageListener for CancellingListener {
        fn on_progress(&self, controller: &Controller) {
            if controller.bytes_transferred() > 0 {
                controller.cancel();
            }
        }
    }

    #[tokio::test]
    async fn test_navigation() {
        let storage = test_storage("storage-ref-navigation").await;
        let root = storage.reference();
        assert!(root.is_root());
        assert_eq!(root.name(), "");
        assert_eq!(root.path(), "/");
        assert!(root.parent().is_none());

        let photo = root.child("images//photo.png");
        assert_eq!(photo.path(), "/images/photo.png");
        assert_eq!(photo.name(), "photo.png");
        assert_eq!(photo.bucket(), storage.bucket());

        let images = photo.parent().expect("has parent");
        assert_eq!(images.name(), "images");
        assert_eq!(images.parent().expect("images' parent is root"), root);
        assert_eq!(photo.root(), root);

        assert_eq!(storage.reference_from_path("images/photo.png"), photo);
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let storage = test_storage("storage-ref-roundtrip").await;
        let reference = storage.reference_from_path("notes/hello.txt");

        let (upload, controller) = reference.put_bytes(b"hello world".to_vec());
        let metadata = upload.await.expect("upload should succeed");
        assert_eq!(metadata.bucket, storage.bucket());
        assert_eq!(metadata.path, "/notes/hello.txt");
        assert_eq!(metadata.name, "hello.txt");
        assert_eq!(metadata.size_bytes, 11);
        assert_eq!(metadata.generation, 1);
        assert_eq!(metadata.metageneration, 1);
        assert!(!metadata.download_token.is_empty());
        assert_eq!(controller.bytes_transferred(), 11);
        assert_eq!(controller.total_byte_count(), 11);

        let (download, _) = reference.get_bytes(1024);
        let bytes = download.await.expect("download should succeed");
        assert_eq!(*bytes, b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_progress_reported_per_chunk() {
        let storage = test_storage("storage-ref-progress").await;
        let reference = storage.reference_from_path("big.bin");
        let total = 2 * TRANSFER_CHUNK_BYTES + 1024;
        let listener = Arc::new(RecordingListener::default());

        let (upload, _) = reference.put_bytes_with(
            vec![0u8; total as usize],
            MetadataUpdate::default(),
            Some(listener.clone()),
        );
        upload.await.expect("upload should succeed");

        let seen = listener.seen.lock().unwrap();
        assert_eq!(seen.len(), 4, "initial event plus one per chunk");
        assert_eq!(seen[0], (0, total));
        assert_eq!(seen[3], (total, total));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_stores_nothing() {
        let storage = test_storage("storage-ref-cancel").await;
        let reference = storage.reference_from_path("cancelled.bin");

        let (upload, _) = reference.put_bytes_with(
            vec![0u8; 3 * TRANSFER_CHUNK_BYTES as usize],
            MetadataUpdate::default(),
            Some(Arc::new(CancellingListener)),
        );
        let err = upload.await.expect_err("cancelled upload must fail");
        assert_eq!(err.code, StorageError::Cancelled.code());

        let err = reference
            .get_metadata()
            .await
            .expect_err("cancelled upload must not store");
        assert_eq!(err.code, StorageError::ObjectNotFound.code());
    }

    #[tokio::test]
    async fn test_download_size_cap() {
        let storage = test_storage("storage-ref-size-cap").await;
        let reference = storage.reference_from_path("cap.bin");
        let (upload, _) = reference.put_bytes(vec![7u8; 10]);
        upload.await.expect("upload should succeed");

        let (download, _) = reference.get_bytes(5);
        let err = download.await.expect_err("undersized cap must fail");
        assert_eq!(err.code, StorageError::DownloadSizeExceeded.code());

        let (download, _) = reference.get_bytes(10);
        assert_eq!(
            download.await.expect("exact cap succeeds").len(),
            10
        );
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let storage = test_storage("storage-ref-missing").await;
        let reference = storage.reference_from_path("absent.bin");

        let (download, _) = reference.get_bytes(1024);
        let err = download.await.expect_err("missing object must fail");
        assert_eq!(err.code, StorageError::ObjectNotFound.code());

        let err = reference.get_metadata().await.expect_err("must fail");
        assert_eq!(err.code, StorageError::ObjectNotFound.code());

        let err = reference.delete_object().await.expect_err("must fail");
        assert_eq!(err.code, StorageError::ObjectNotFound.code());
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let storage = test_storage("storage-ref-metadata").await;
        let reference = storage.reference_from_path("doc.txt");
        let (upload, _) = reference.put_bytes_with(
            b"text".to_vec(),
            MetadataUpdate::default().content_type("application/octet-stream"),
            None,
        );
        let stored = upload.await.expect("upload should succeed");
        assert_eq!(
            stored.content_type.as_deref(),
            Some("application/octet-stream")
        );

        let mut custom = HashMap::new();
        custom.insert("owner".to_string(), "alice".to_string());
        let updated = reference
            .update_metadata(
                MetadataUpdate::default()
                    .content_type("text/plain")
                    .custom_metadata(custom.clone()),
            )
            .await
            .expect("update should succeed");
        assert_eq!(updated.content_type.as_deref(), Some("text/plain"));
        assert_eq!(updated.custom_metadata, custom);
        assert_eq!(updated.generation, 1, "data generation is untouched");
        assert_eq!(updated.metageneration, 2);

        let fetched = reference.get_metadata().await.expect("get should succeed");
        assert_eq!(*fetched, *updated);
    }

    #[tokio::test]
    async fn test_overwrite_starts_new_generation() {
        let storage = test_storage("storage-ref-overwrite").await;
        let reference = storage.reference_from_path("versioned.bin");

        let (first_upload, _) = reference.put_bytes(vec![1u8; 4]);
        let first = first_upload.await.expect("upload should succeed");

        let (second_upload, _) = reference.put_bytes(vec![2u8; 6]);
        let second = second_upload.await.expect("upload should succeed");

        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(second.metageneration, 1);
        assert_eq!(second.size_bytes, 6);
        assert_ne!(second.download_token, first.download_token);

        let (download, _) = reference.get_bytes(16);
        assert_eq!(*download.await.expect("download should succeed"), vec![2u8; 6]);
    }

    #[tokio::test]
    async fn test_delete_object() {
        let storage = test_storage("storage-ref-delete").await;
        let reference = storage.reference_from_path("temp.bin");
        let (upload, _) = reference.put_bytes(vec![0u8; 3]);
        upload.await.expect("upload should succeed");

        reference.delete_object().await.expect("delete should succeed");

        let err = reference.get_metadata().await.expect_err("object is gone");
        assert_eq!(err.code, StorageError::ObjectNotFound.code());
    }

    #[tokio::test]
    async fn test_quota_enforced_at_finalize() {
        let storage = test_storage("storage-ref-quota").await;
        storage.set_quota(Some(8));

        let first = storage.reference_from_path("a.bin");
        let (upload, _) = first.put_bytes(vec![0u8; 5]);
        upload.await.expect("upload within quota succeeds");

        let second = storage.reference_from_path("b.bin");
        let (upload, _) = second.put_bytes(vec![0u8; 6]);
        let err = upload.await.expect_err("upload past quota must fail");
        assert_eq!(err.code, StorageError::QuotaExceeded.code());

        // Overwrites count the replaced bytes as freed.
        let (upload, _) = first.put_bytes(vec![0u8; 8]);
        upload.await.expect("replacement within quota succeeds");
    }

    #[tokio::test]
    async fn test_transfer_budget_exhausted() {
        let storage = test_storage("storage-ref-budget").await;
        let reference = storage.reference_from_path("slow.bin");
        let (upload, _) = reference.put_bytes(vec![0u8; 64]);
        upload.await.expect("upload should succeed");

        storage.set_max_download_retry_time(Duration::ZERO);
        let (download, _) = reference.get_bytes(1024);
        let err = download.await.expect_err("exhausted budget must fail");
        assert_eq!(err.code, StorageError::RetryLimitExceeded.code());

        storage.set_max_upload_retry_time(Duration::ZERO);
        let (upload, _) = reference.put_bytes(vec![0u8; 64]);
        let err = upload.await.expect_err("exhausted budget must fail");
        assert_eq!(err.code, StorageError::RetryLimitExceeded.code());
    }

    #[tokio::test]
    async fn test_put_to_root_fails() {
        let storage = test_storage("storage-ref-root-put").await;
        let (upload, _) = storage.reference().put_bytes(vec![1u8]);
        let err = upload.await.expect_err("root upload must fail");
        assert_eq!(err.code, StorageError::Unknown.code());
    }

    #[tokio::test]
    async fn test_last_result_tracks_most_recent_call() {
        let storage = test_storage("storage-ref-last").await;
        let reference = storage.reference_from_path("tracked.bin");
        assert_eq!(
            reference.put_bytes_last_result().status(),
            FutureStatus::Invalid
        );

        let (upload, _) = reference.put_bytes(vec![0u8; 2]);
        assert_eq!(
            reference.put_bytes_last_result().handle(),
            upload.handle()
        );
        upload.await.expect("upload should succeed");
        assert_eq!(
            reference.put_bytes_last_result().status(),
            FutureStatus::Complete
        );

        reference.delete_object().await.expect("delete should succeed");
        assert_eq!(
            reference.delete_object_last_result().status(),
            FutureStatus::Complete
        );
    }
}
