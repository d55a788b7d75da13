//! Caller-held handle to the eventual outcome of one asynchronous operation

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::future::registry::{FutureHandle, FutureRegistry, FutureStatus};

/// Result handle returned by every asynchronous SDK call
///
/// Pairs a registry reference with the handle of one operation record.
/// Cloning takes another reference to the record; dropping releases it. A
/// default-constructed future references nothing and permanently reports
/// [`FutureStatus::Invalid`], error `0`, an empty message and no result;
/// calling accessors on it is harmless.
///
/// Completion can be observed three ways: polling [`status`], registering a
/// callback with [`on_completion`], or `.await`ing the future on a Tokio
/// runtime.
///
/// [`status`]: Future::status
/// [`on_completion`]: Future::on_completion
pub struct Future<T> {
    registry: Option<Arc<FutureRegistry>>,
    handle: FutureHandle,
    _result: PhantomData<fn() -> T>,
}

impl<T> Future<T> {
    /// Internal: wrap a freshly allocated record, taking over its first
    /// reference.
    pub(crate) fn from_parts(registry: Arc<FutureRegistry>, handle: FutureHandle) -> Self {
        Future {
            registry: Some(registry),
            handle,
            _result: PhantomData,
        }
    }

    /// Handle of the backing record, for use with the registry API
    pub fn handle(&self) -> FutureHandle {
        self.handle
    }

    /// Current status of the operation
    pub fn status(&self) -> FutureStatus {
        match &self.registry {
            Some(registry) => registry.status(self.handle),
            None => FutureStatus::Invalid,
        }
    }

    /// Error code of the completed operation; `0` before completion and for
    /// successful completions
    pub fn error(&self) -> i32 {
        match &self.registry {
            Some(registry) => registry.error(self.handle),
            None => 0,
        }
    }

    /// Error message of the completed operation; empty before completion and
    /// for successful completions
    pub fn error_message(&self) -> String {
        match &self.registry {
            Some(registry) => registry.error_message(self.handle),
            None => String::new(),
        }
    }

    /// Register the completion callback for this operation
    ///
    /// The callback fires exactly once, with the completed future as its
    /// argument, possibly on a different thread than the registration. If the
    /// operation already completed it fires immediately on the calling
    /// thread. An operation holds one callback slot: registering again
    /// replaces the earlier callback (last writer wins). On an invalid future
    /// the callback is silently dropped and never fires.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
        T: 'static,
    {
        let Some(registry) = &self.registry else {
            return;
        };
        let completed = self.clone();
        registry.set_completion_callback(self.handle, Box::new(move || callback(&completed)));
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Shared view of the result payload; `None` until the operation
    /// completes successfully
    ///
    /// The payload is immutable once visible, so the returned [`Arc`] can be
    /// read from any thread without further synchronization.
    pub fn result(&self) -> Option<Arc<T>> {
        match &self.registry {
            Some(registry) => registry.result(self.handle),
            None => None,
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Future {
            registry: None,
            handle: FutureHandle::NULL,
            _result: PhantomData,
        }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        if let Some(registry) = &self.registry {
            registry.reference(self.handle);
        }
        Future {
            registry: self.registry.clone(),
            handle: self.handle,
            _result: PhantomData,
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.release(self.handle);
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("handle", &self.handle)
            .field("status", &self.status())
            .field("error", &self.error())
            .finish()
    }
}

/// Error side of an awaited future: the completed operation's code and
/// message
///
/// Codes are the stable per-module tables from [`crate::error`]. Negative
/// codes mark client-side misuse: `-2` for awaiting an invalid future, `-3`
/// for a completion without a usable result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureError {
    /// Stable error code of the failed operation
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

impl FutureError {
    pub(crate) fn invalid() -> Self {
        FutureError {
            code: -2,
            message: "awaited an invalid future".to_string(),
        }
    }

    pub(crate) fn missing_result() -> Self {
        FutureError {
            code: -3,
            message: "operation completed without a usable result".to_string(),
        }
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation failed with code {}: {}", self.code, self.message)
    }
}

impl std::error::Error for FutureError {}

impl<T: Send + Sync + 'static> std::future::IntoFuture for Future<T> {
    type Output = Result<Arc<T>, FutureError>;
    type IntoFuture = Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    /// Await completion on a Tokio runtime
    ///
    /// Waits through the record's completion-callback slot, so it replaces
    /// any callback registered earlier (last writer wins). An invalid future
    /// resolves immediately with code `-2`.
    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.status() {
                FutureStatus::Invalid => return Err(FutureError::invalid()),
                FutureStatus::Complete => {}
                FutureStatus::Pending => {
                    let (tx, rx) = oneshot::channel();
                    self.on_completion(move |_| {
                        let _ = tx.send(());
                    });
                    // A completion racing the registration fires the callback
                    // synchronously above, so the receiver cannot miss it.
                    let _ = rx.await;
                }
            }
            match self.error() {
                0 => self.result().ok_or_else(FutureError::missing_result),
                code => Err(FutureError {
                    code,
                    message: self.error_message(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> Arc<FutureRegistry> {
        Arc::new(FutureRegistry::new())
    }

    #[test]
    fn test_default_future_reports_neutral_values() {
        let future: Future<String> = Future::default();

        for _ in 0..3 {
            assert_eq!(future.status(), FutureStatus::Invalid);
            assert_eq!(future.error(), 0);
            assert_eq!(future.error_message(), "");
            assert!(future.result().is_none());
        }
    }

    #[test]
    fn test_default_future_drops_callback_silently() {
        let future: Future<i32> = Future::default();
        future.on_completion(|_| panic!("must never fire"));
    }

    #[test]
    fn test_clone_references_and_drop_releases() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        let handle = future.handle();

        let copy = future.clone();
        registry.complete(handle, 1);

        drop(future);
        assert!(registry.contains(handle), "copy still references the record");
        drop(copy);
        assert!(!registry.contains(handle));
    }

    #[test]
    fn test_status_is_monotonic_across_wrappers() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        let copy = future.clone();

        assert_eq!(copy.status(), FutureStatus::Pending);
        registry.complete(future.handle(), 10);

        for wrapper in [&future, &copy] {
            assert_eq!(wrapper.status(), FutureStatus::Complete);
            assert_eq!(*wrapper.result().unwrap(), 10);
        }
    }

    #[test]
    fn test_debug_does_not_require_result_type_bounds() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        let rendered = format!("{:?}", future);
        assert!(rendered.contains("Pending"));
    }

    #[tokio::test]
    async fn test_await_pending_future() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        let handle = future.handle();

        let completer = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.complete(handle, 21);
        });

        let value = future.await.expect("future should resolve");
        assert_eq!(*value, 21);
    }

    #[tokio::test]
    async fn test_await_completed_future() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        registry.complete(future.handle(), 4);

        assert_eq!(*future.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_await_failed_future() {
        let registry = registry();
        let future = registry.alloc::<i32>();
        registry.fail(future.handle(), 13, "no user");

        let err = future.await.expect_err("failed future must err");
        assert_eq!(err.code, 13);
        assert_eq!(err.message, "no user");
    }

    #[tokio::test]
    async fn test_await_invalid_future() {
        let future: Future<i32> = Future::default();
        let err = future.await.expect_err("invalid future must err");
        assert_eq!(err.code, -2);
    }
}
