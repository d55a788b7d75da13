//! Reference-counted registry of asynchronous operation records
//!
//! Every asynchronous API in the SDK allocates a record here and hands the
//! caller a [`Future`](crate::future::Future) wrapping the record's handle.
//! The subsystem that issued the operation later completes the record with a
//! result or an error; callers observe completion by polling or through a
//! completion callback.
//!
//! # Design
//! Records live in a single locked table keyed by handle. Handles are
//! allocated from a monotonic counter and never reused, so a stale handle
//! reads as [`FutureStatus::Invalid`] instead of aliasing a newer operation.
//! A record is reclaimed only once its reference count reaches zero *and* it
//! has completed; an in-flight operation keeps its record even when no caller
//! currently holds a handle to it.
//!
//! User callbacks never run, and replaced callbacks never drop, while the
//! table lock is held; either may itself reference or release a handle.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::future::future::Future;

/// Status of one asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureStatus {
    /// No operation backs this handle (default futures, reclaimed records)
    Invalid,
    /// The operation has been issued but has not finished
    Pending,
    /// The operation finished; error and result are now readable
    Complete,
}

/// Opaque identifier of one operation record inside its owning registry
///
/// Meaningless across registries. Handle `0` is reserved for the null
/// (default) future and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureHandle(u64);

impl FutureHandle {
    pub(crate) const NULL: FutureHandle = FutureHandle(0);
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

struct FutureRecord {
    status: FutureStatus,
    error_code: i32,
    error_message: String,
    result: Option<Arc<dyn Any + Send + Sync>>,
    ref_count: usize,
    callback: Option<CompletionCallback>,
}

/// Table of asynchronous operation records, shared by one SDK subsystem
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use nimbus_sdk::future::{FutureRegistry, FutureStatus};
///
/// let registry = Arc::new(FutureRegistry::new());
/// let future = registry.alloc::<i32>();
/// assert_eq!(future.status(), FutureStatus::Pending);
///
/// registry.complete(future.handle(), 41);
/// assert_eq!(future.status(), FutureStatus::Complete);
/// assert_eq!(*future.result().unwrap(), 41);
/// ```
pub struct FutureRegistry {
    records: Mutex<HashMap<FutureHandle, FutureRecord>>,
    next_id: AtomicU64,
}

impl FutureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        FutureRegistry {
            records: Mutex::new(HashMap::new()),
            // 0 is FutureHandle::NULL
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a pending record and return the first handle to it
    ///
    /// The returned future holds the record's initial reference. The issuing
    /// subsystem completes the record later through [`complete`] or [`fail`]
    /// using [`Future::handle`].
    ///
    /// [`complete`]: FutureRegistry::complete
    /// [`fail`]: FutureRegistry::fail
    pub fn alloc<T>(self: &Arc<Self>) -> Future<T> {
        let handle = FutureHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records().insert(
            handle,
            FutureRecord {
                status: FutureStatus::Pending,
                error_code: 0,
                error_message: String::new(),
                result: None,
                ref_count: 1,
                callback: None,
            },
        );
        Future::from_parts(Arc::clone(self), handle)
    }

    /// Increment the reference count of a record
    ///
    /// Called whenever a future wrapper over the handle is copied.
    /// Referencing a reclaimed or never-allocated handle is a precondition
    /// violation; it is logged and otherwise ignored.
    pub fn reference(&self, handle: FutureHandle) {
        let mut records = self.records();
        match records.get_mut(&handle) {
            Some(record) => record.ref_count += 1,
            None => {
                debug_assert!(false, "reference on unknown future handle");
                warn!(?handle, "reference on unknown future handle");
            }
        }
    }

    /// Decrement the reference count of a record
    ///
    /// When the count reaches zero and the record has completed, the record
    /// is reclaimed. A pending record is never reclaimed here; the issuing
    /// subsystem still owns the outcome. Releasing without a matching prior
    /// reference is a contract violation; it is logged and otherwise ignored.
    pub fn release(&self, handle: FutureHandle) {
        let reclaimed = {
            let mut records = self.records();
            match records.get_mut(&handle) {
                None => {
                    debug_assert!(false, "release on unknown future handle");
                    warn!(?handle, "release on unknown future handle");
                    None
                }
                Some(record) if record.ref_count == 0 => {
                    debug_assert!(false, "release without matching reference");
                    warn!(?handle, "release without matching reference");
                    None
                }
                Some(record) => {
                    record.ref_count -= 1;
                    if record.ref_count == 0 && record.status == FutureStatus::Complete {
                        records.remove(&handle)
                    } else {
                        None
                    }
                }
            }
        };
        // May hold an unfired callback whose drop re-enters the registry.
        drop(reclaimed);
    }

    /// Status of the record behind `handle`
    ///
    /// Unknown handles read as [`FutureStatus::Invalid`].
    pub fn status(&self, handle: FutureHandle) -> FutureStatus {
        self.records()
            .get(&handle)
            .map(|record| record.status)
            .unwrap_or(FutureStatus::Invalid)
    }

    /// Error code of the record behind `handle`
    ///
    /// `0` until the record completes, so polling code never has to branch
    /// on status first.
    pub fn error(&self, handle: FutureHandle) -> i32 {
        self.records()
            .get(&handle)
            .map(|record| record.error_code)
            .unwrap_or(0)
    }

    /// Error message of the record behind `handle`; empty until completion
    pub fn error_message(&self, handle: FutureHandle) -> String {
        self.records()
            .get(&handle)
            .map(|record| record.error_message.clone())
            .unwrap_or_default()
    }

    /// Typed view of the record's result payload
    ///
    /// `None` until the record completes, and for error completions. The
    /// payload is written together with the completion transition and never
    /// mutated afterwards, so holders of the returned [`Arc`] need no further
    /// synchronization.
    pub fn result<T: Send + Sync + 'static>(&self, handle: FutureHandle) -> Option<Arc<T>> {
        let payload = {
            let records = self.records();
            match records.get(&handle) {
                Some(record) if record.status == FutureStatus::Complete => record.result.clone(),
                _ => None,
            }
        }?;
        match payload.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                debug_assert!(false, "future result downcast to the wrong type");
                None
            }
        }
    }

    /// Register the completion callback for a record
    ///
    /// Fires exactly once, when the record transitions to complete. If the
    /// record has already completed the callback fires immediately, on the
    /// calling thread. A record holds at most one callback: registering again
    /// replaces the previous one (last writer wins), and the replaced closure
    /// is dropped unfired.
    pub fn set_completion_callback(&self, handle: FutureHandle, callback: CompletionCallback) {
        let mut fire: Option<CompletionCallback> = None;
        let mut discard: Option<CompletionCallback> = None;
        {
            let mut records = self.records();
            match records.get_mut(&handle) {
                None => {
                    warn!(?handle, "completion callback on unknown future handle");
                    discard = Some(callback);
                }
                Some(record) if record.status == FutureStatus::Complete => {
                    fire = Some(callback);
                }
                Some(record) => {
                    discard = record.callback.replace(callback);
                }
            }
        }
        if let Some(callback) = fire {
            callback();
        }
        drop(discard);
    }

    /// Complete a pending record with a successful result
    ///
    /// Sets error `0`, stores the payload, and fires the registered callback,
    /// in an order that guarantees any observer of the complete status also
    /// sees the fully written payload.
    pub fn complete<T: Send + Sync + 'static>(&self, handle: FutureHandle, value: T) {
        self.resolve(handle, 0, String::new(), Some(Arc::new(value)));
    }

    /// Complete a pending record with an error code and message
    pub fn fail(&self, handle: FutureHandle, code: i32, message: impl Into<String>) {
        debug_assert!(code != 0, "failing a future requires a non-zero code");
        self.resolve(handle, code, message.into(), None);
    }

    fn resolve(
        &self,
        handle: FutureHandle,
        error_code: i32,
        error_message: String,
        result: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        let mut fire: Option<CompletionCallback> = None;
        let mut reclaimed = None;
        {
            let mut records = self.records();
            match records.get_mut(&handle) {
                None => {
                    warn!(?handle, "completing an unknown future handle");
                }
                Some(record) if record.status == FutureStatus::Complete => {
                    // Completion happens at most once; keep the first outcome.
                    debug_assert!(false, "future completed twice");
                    warn!(?handle, "future completed twice; keeping the first outcome");
                }
                Some(record) => {
                    record.status = FutureStatus::Complete;
                    record.error_code = error_code;
                    record.error_message = error_message;
                    record.result = result;
                    fire = record.callback.take();
                    if record.ref_count == 0 {
                        reclaimed = records.remove(&handle);
                    }
                }
            }
        }
        if let Some(callback) = fire {
            callback();
        }
        drop(reclaimed);
    }

    /// Whether a record currently backs `handle`
    pub fn contains(&self, handle: FutureHandle) -> bool {
        self.records().contains_key(&handle)
    }

    /// Number of live records (pending or complete-but-referenced)
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Whether the registry holds no live records
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    // A poisoned table still serves reads; record state stays consistent
    // because every mutation completes under one guard.
    fn records(&self) -> MutexGuard<'_, HashMap<FutureHandle, FutureRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FutureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FutureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureRegistry")
            .field("records", &self.len())
            .finish()
    }
}
