//! Location handles: navigation plus the read, write and transaction surface

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::database::data_snapshot::DataSnapshot;
use crate::database::database::{Database, DatabaseInner};
use crate::database::listener::{self, ListenerRegistration, ValueListener};
use crate::database::mutable_data::MutableData;
use crate::database::transaction::{self, TransactionOptions, TransactionResult};
use crate::database::value;
use crate::error::DatabaseError;
use crate::future::Future;

/// A location in the database tree
///
/// References are cheap to clone and navigate; no remote work happens until
/// an operation is called. Every operation returns immediately with a
/// [`Future`] that resolves on a background task.
///
/// # Example
///
/// ```no_run
/// # async fn example(database: nimbus_sdk::database::Database) {
/// let scores = database.reference().child("scores");
/// scores.child("alice").set_value(10).await.ok();
/// let snapshot = scores.child("alice").get_value().await.unwrap();
/// assert_eq!(snapshot.value(), 10);
/// # }
/// ```
#[derive(Clone)]
pub struct DatabaseReference {
    inner: Arc<DatabaseInner>,
    /// Normalized slash-separated location; empty for the root
    path: String,
}

impl DatabaseReference {
    pub(crate) fn new(inner: Arc<DatabaseInner>, path: String) -> Self {
        DatabaseReference { inner, path }
    }

    /// The database this reference belongs to
    pub fn database(&self) -> Database {
        Database::from_inner(Arc::clone(&self.inner))
    }

    /// Last path segment, or `None` at the root
    pub fn key(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            self.path.rsplit('/').next()
        }
    }

    /// Absolute slash-separated path of this location
    pub fn path(&self) -> String {
        format!("/{}", self.path)
    }

    /// Whether this reference points at the tree root
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// A reference to a location below this one
    ///
    /// `path` may span several segments (`"users/alice"`). Path validity is
    /// checked when an operation runs, not here.
    pub fn child(&self, path: &str) -> DatabaseReference {
        DatabaseReference {
            inner: Arc::clone(&self.inner),
            path: value::join_path(&self.path, path),
        }
    }

    /// The parent location, or `None` at the root
    pub fn parent(&self) -> Option<DatabaseReference> {
        if self.path.is_empty() {
            return None;
        }
        let parent = match self.path.rsplit_once('/') {
            Some((rest, _)) => rest.to_string(),
            None => String::new(),
        };
        Some(DatabaseReference {
            inner: Arc::clone(&self.inner),
            path: parent,
        })
    }

    /// A reference to the tree root
    pub fn root(&self) -> DatabaseReference {
        DatabaseReference {
            inner: Arc::clone(&self.inner),
            path: String::new(),
        }
    }

    /// Read the current value at this location
    pub fn get_value(&self) -> Future<DataSnapshot> {
        let future = self.inner.futures.alloc::<DataSnapshot>();
        let handle = future.handle();
        let backend = Arc::clone(&self.inner.backend);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        let key = self.key_owned();
        tokio::spawn(async move {
            match backend.fetch(&path).await {
                Ok(fetched) => registry.complete(handle, DataSnapshot::new(key, fetched.node)),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.get_value.set(&future);
        future
    }

    /// Replace the value at this location
    ///
    /// Any priority previously stored here is cleared; use
    /// [`set_value_and_priority`](Self::set_value_and_priority) to keep one.
    /// Writing `Value::Null` removes the location.
    pub fn set_value(&self, new_value: impl Into<Value>) -> Future<()> {
        let node = new_value.into();
        // Validate the node (error case first)
        let future = match value::validate_writable(&node) {
            Ok(()) => self.spawn_put(node),
            Err(err) => self.failed_future(&err),
        };
        self.inner.last.set_value.set(&future);
        future
    }

    /// Replace the value and priority at this location in one write
    pub fn set_value_and_priority(
        &self,
        new_value: impl Into<Value>,
        priority: impl Into<Value>,
    ) -> Future<()> {
        let node = new_value.into();
        let priority = priority.into();
        // Validate the node (error case first)
        let future = if let Err(err) = value::validate_writable(&node) {
            self.failed_future(&err)
        } else if !value::valid_priority(&priority) {
            self.failed_future(&DatabaseError::InvalidValue(
                "priority must be null, a number or a string".to_string(),
            ))
        } else {
            self.spawn_put(value::with_priority(node, priority))
        };
        self.inner.last.set_value.set(&future);
        future
    }

    /// Set the priority of the value already stored at this location
    ///
    /// Does nothing when the location holds no value.
    pub fn set_priority(&self, priority: impl Into<Value>) -> Future<()> {
        let priority = priority.into();
        // Validate the priority (error case first)
        let future = if !value::valid_priority(&priority) {
            self.failed_future(&DatabaseError::InvalidValue(
                "priority must be null, a number or a string".to_string(),
            ))
        } else {
            let future = self.inner.futures.alloc::<()>();
            let handle = future.handle();
            let backend = Arc::clone(&self.inner.backend);
            let registry = Arc::clone(&self.inner.futures);
            let path = self.path.clone();
            tokio::spawn(async move {
                match backend.set_priority(&path, priority).await {
                    Ok(_) => registry.complete(handle, ()),
                    Err(err) => registry.fail(handle, err.code(), err.to_string()),
                }
            });
            future
        };
        self.inner.last.set_value.set(&future);
        future
    }

    /// Remove the value at this location
    pub fn remove_value(&self) -> Future<()> {
        let future = self.spawn_put(Value::Null);
        self.inner.last.remove_value.set(&future);
        future
    }

    /// Apply several writes below this location as one atomic step
    ///
    /// Keys are paths relative to this reference and may span several
    /// segments. A null value removes that child.
    pub fn update_children(&self, updates: HashMap<String, Value>) -> Future<()> {
        // Validate keys and nodes (error case first)
        let mut invalid = None;
        for (key, node) in &updates {
            if key.trim_matches('/').is_empty() {
                invalid = Some(DatabaseError::InvalidPath("empty update key".to_string()));
                break;
            }
            if let Err(err) = value::split_path(key).and(value::validate_writable(node)) {
                invalid = Some(err);
                break;
            }
        }
        let future = match invalid {
            Some(err) => self.failed_future(&err),
            None => {
                let future = self.inner.futures.alloc::<()>();
                let handle = future.handle();
                let backend = Arc::clone(&self.inner.backend);
                let registry = Arc::clone(&self.inner.futures);
                let path = self.path.clone();
                tokio::spawn(async move {
                    match backend.merge(&path, updates).await {
                        Ok(_) => registry.complete(handle, ()),
                        Err(err) => registry.fail(handle, err.code(), err.to_string()),
                    }
                });
                future
            }
        };
        self.inner.last.update_children.set(&future);
        future
    }

    /// Atomically transform the value at this location
    ///
    /// `callback` runs against the freshest known state and may run several
    /// times when concurrent writes interfere; it must be free of side
    /// effects beyond the [`MutableData`] it is given. Returning
    /// [`TransactionResult::Abort`] stops the transaction without writing.
    pub fn run_transaction<F>(&self, callback: F) -> Future<DataSnapshot>
    where
        F: FnMut(&mut MutableData<'_>) -> TransactionResult + Send + 'static,
    {
        self.run_transaction_with_options(callback, TransactionOptions::default())
    }

    /// [`run_transaction`](Self::run_transaction) with explicit retry tuning
    pub fn run_transaction_with_options<F>(
        &self,
        callback: F,
        options: TransactionOptions,
    ) -> Future<DataSnapshot>
    where
        F: FnMut(&mut MutableData<'_>) -> TransactionResult + Send + 'static,
    {
        let future = transaction::spawn(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.futures),
            self.path.clone(),
            callback,
            options,
        );
        self.inner.last.run_transaction.set(&future);
        future
    }

    /// Observe the value at this location
    ///
    /// The listener receives the current value immediately and again after
    /// every write that can affect it. Remove it with the returned
    /// registration.
    pub fn add_value_listener(&self, value_listener: Arc<dyn ValueListener>) -> ListenerRegistration {
        listener::spawn_value_listener(
            Arc::clone(&self.inner.backend),
            self.path.clone(),
            self.key_owned(),
            value_listener,
        )
    }

    /// Future of the most recent [`get_value`](Self::get_value) call made
    /// through this database instance
    pub fn get_value_last_result(&self) -> Future<DataSnapshot> {
        self.inner.last.get_value.get()
    }

    /// Future of the most recent value or priority write
    pub fn set_value_last_result(&self) -> Future<()> {
        self.inner.last.set_value.get()
    }

    /// Future of the most recent [`update_children`](Self::update_children)
    /// call
    pub fn update_children_last_result(&self) -> Future<()> {
        self.inner.last.update_children.get()
    }

    /// Future of the most recent [`remove_value`](Self::remove_value) call
    pub fn remove_value_last_result(&self) -> Future<()> {
        self.inner.last.remove_value.get()
    }

    /// Future of the most recent [`run_transaction`](Self::run_transaction)
    /// call
    pub fn run_transaction_last_result(&self) -> Future<DataSnapshot> {
        self.inner.last.run_transaction.get()
    }

    fn key_owned(&self) -> Option<String> {
        self.key().map(str::to_string)
    }

    fn spawn_put(&self, node: Value) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let backend = Arc::clone(&self.inner.backend);
        let registry = Arc::clone(&self.inner.futures);
        let path = self.path.clone();
        tokio::spawn(async move {
            match backend.put(&path, node).await {
                Ok(_) => registry.complete(handle, ()),
                Err(err) => registry.fail(handle, err.code(), err.to_string()),
            }
        });
        future
    }

    fn failed_future<T: Send + Sync + 'static>(&self, err: &DatabaseError) -> Future<T> {
        let future = self.inner.futures.alloc::<T>();
        self.inner
            .futures
            .fail(future.handle(), err.code(), err.to_string());
        future
    }
}

impl PartialEq for DatabaseReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.path == other.path
    }
}

impl std::fmt::Debug for DatabaseReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseReference")
            .field("url", &self.inner.url)
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backend::MemoryBackend;
    use crate::database::database::LastResults;
    use crate::future::{FutureRegistry, FutureStatus};
    use serde_json::json;

    fn unit_reference() -> DatabaseReference {
        let inner = Arc::new(DatabaseInner {
            app_name: "[DEFAULT]".to_string(),
            url: "https://unit.db.nimbus.dev".to_string(),
            backend: Arc::new(MemoryBackend::new()),
            futures: Arc::new(FutureRegistry::new()),
            last: LastResults::default(),
        });
        DatabaseReference::new(inner, String::new())
    }

    #[test]
    fn test_navigation() {
        let root = unit_reference();
        assert!(root.is_root());
        assert_eq!(root.key(), None);
        assert_eq!(root.path(), "/");
        assert!(root.parent().is_none());

        let alice = root.child("users/alice");
        assert_eq!(alice.key(), Some("alice"));
        assert_eq!(alice.path(), "/users/alice");
        assert!(!alice.is_root());

        let users = alice.parent().expect("has parent");
        assert_eq!(users.key(), Some("users"));
        assert_eq!(users.parent().expect("users' parent is root"), root);
        assert_eq!(alice.root(), root);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let root = unit_reference();
        let alice = root.child("scores/alice");

        alice.set_value(10).await.expect("set should succeed");
        let snapshot = alice.get_value().await.expect("get should succeed");
        assert_eq!(snapshot.value(), json!(10));
        assert_eq!(snapshot.key(), Some("alice"));
        assert!(snapshot.exists());
    }

    #[tokio::test]
    async fn test_set_value_clears_priority() {
        let reference = unit_reference().child("ranked");

        reference
            .set_value_and_priority("first", 1)
            .await
            .expect("write should succeed");
        let snapshot = reference.get_value().await.expect("get should succeed");
        assert_eq!(snapshot.value(), json!("first"));
        assert_eq!(snapshot.priority(), json!(1));

        reference.set_value("second").await.expect("write should succeed");
        let snapshot = reference.get_value().await.expect("get should succeed");
        assert_eq!(snapshot.value(), json!("second"));
        assert_eq!(snapshot.priority(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_set_priority_keeps_value() {
        let reference = unit_reference().child("ranked");

        reference.set_value("item").await.expect("write should succeed");
        reference.set_priority(7).await.expect("priority should apply");

        let snapshot = reference.get_value().await.expect("get should succeed");
        assert_eq!(snapshot.value(), json!("item"));
        assert_eq!(snapshot.priority(), json!(7));
    }

    #[tokio::test]
    async fn test_remove_value() {
        let reference = unit_reference().child("temp");
        reference.set_value(1).await.expect("write should succeed");
        reference.remove_value().await.expect("remove should succeed");

        let snapshot = reference.get_value().await.expect("get should succeed");
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn test_update_children_merges() {
        let root = unit_reference();
        root.child("users")
            .set_value(json!({ "alice": { "score": 1 }, "bob": { "score": 2 } }))
            .await
            .expect("seed should succeed");

        let mut updates = HashMap::new();
        updates.insert("alice/score".to_string(), json!(10));
        updates.insert("carol".to_string(), json!({ "score": 3 }));
        root.child("users")
            .update_children(updates)
            .await
            .expect("update should succeed");

        let snapshot = root.child("users").get_value().await.expect("get should succeed");
        assert_eq!(
            snapshot.value(),
            json!({
                "alice": { "score": 10 },
                "bob": { "score": 2 },
                "carol": { "score": 3 },
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_write_fails_without_touching_backend() {
        let reference = unit_reference().child("users");

        let err = reference
            .set_value(json!({ "bad#key": 1 }))
            .await
            .expect_err("forbidden key must fail");
        assert_eq!(err.code, DatabaseError::InvalidValue(String::new()).code());

        let mut updates = HashMap::new();
        updates.insert("a#b".to_string(), json!(1));
        let err = reference
            .update_children(updates)
            .await
            .expect_err("forbidden update key must fail");
        assert_eq!(err.code, DatabaseError::InvalidPath(String::new()).code());

        let snapshot = reference.get_value().await.expect("get should succeed");
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn test_last_result_tracks_most_recent_call() {
        let reference = unit_reference().child("tracked");
        assert_eq!(
            reference.get_value_last_result().status(),
            FutureStatus::Invalid
        );

        reference.set_value(5).await.expect("write should succeed");
        let last = reference.set_value_last_result();
        assert_eq!(last.status(), FutureStatus::Complete);

        let future = reference.get_value();
        assert_eq!(
            reference.get_value_last_result().handle(),
            future.handle()
        );
        future.await.expect("get should succeed");
    }

    #[tokio::test]
    async fn test_transaction_through_reference() {
        let reference = unit_reference().child("counter");
        reference.set_value(41).await.expect("seed should succeed");

        let snapshot = reference
            .run_transaction(|data| {
                let current = data.value().as_i64().unwrap_or(0);
                data.set_value(current + 1);
                TransactionResult::Success
            })
            .await
            .expect("transaction should commit");
        assert_eq!(snapshot.value(), json!(42));
        assert_eq!(snapshot.key(), Some("counter"));

        let last = reference.run_transaction_last_result();
        assert_eq!(last.status(), FutureStatus::Complete);
    }
}
