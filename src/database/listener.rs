//! Value listeners: push-style observation of one database location

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::database::backend::{ChangeEvent, DatabaseBackend};
use crate::database::data_snapshot::DataSnapshot;
use crate::database::value;
use crate::error::DatabaseError;

/// Observer of the value at one location
///
/// `on_value_changed` fires once with the current value when the listener is
/// attached and again after every committed write that touches the observed
/// location or anything above or below it.
pub trait ValueListener: Send + Sync {
    /// Called with a fresh snapshot of the observed location
    fn on_value_changed(&self, snapshot: DataSnapshot);

    /// Called once when the listener stops receiving updates for a reason
    /// other than removal
    fn on_cancelled(&self, _error: &DatabaseError) {}
}

/// Handle for removing a value listener
pub struct ListenerRegistration {
    cancel_tx: mpsc::Sender<()>,
}

impl ListenerRegistration {
    /// Removes the listener and stops receiving updates
    ///
    /// Dropping the registration without calling this has the same effect.
    pub async fn remove(self) {
        let _ = self.cancel_tx.send(()).await;
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration").finish_non_exhaustive()
    }
}

pub(crate) fn spawn_value_listener(
    backend: Arc<dyn DatabaseBackend>,
    path: String,
    key: Option<String>,
    listener: Arc<dyn ValueListener>,
) -> ListenerRegistration {
    let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
    let mut changes = backend.subscribe();

    tokio::spawn(async move {
        // Deliver the current value before any change events.
        match backend.fetch(&path).await {
            Ok(fetched) => listener.on_value_changed(DataSnapshot::new(key.clone(), fetched.node)),
            Err(err) => {
                listener.on_cancelled(&err);
                return;
            }
        }

        loop {
            tokio::select! {
                // Both removal and a dropped registration close the channel;
                // either stops the listener.
                _ = cancel_rx.recv() => break,
                event = changes.recv() => {
                    let relevant = match event {
                        Ok(ChangeEvent::Write { path: changed, .. }) => {
                            value::paths_overlap(&path, &changed)
                        }
                        Ok(ChangeEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                            listener.on_cancelled(&DatabaseError::Disconnected);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Events were dropped; the next fetch resyncs.
                            debug!(path = %path, missed, "value listener lagged; resyncing");
                            true
                        }
                    };
                    if relevant {
                        match backend.fetch(&path).await {
                            Ok(fetched) => {
                                listener.on_value_changed(DataSnapshot::new(key.clone(), fetched.node));
                            }
                            Err(err) => {
                                listener.on_cancelled(&err);
                                break;
                            }
                        }
                    }
                }
            }
        }
    });

    ListenerRegistration { cancel_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backend::MemoryBackend;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        values: Mutex<Vec<Value>>,
        cancellations: Mutex<Vec<i32>>,
    }

    impl ValueListener for RecordingListener {
        fn on_value_changed(&self, snapshot: DataSnapshot) {
            self.values.lock().unwrap().push(snapshot.value());
        }

        fn on_cancelled(&self, error: &DatabaseError) {
            self.cancellations.lock().unwrap().push(error.code());
        }
    }

    async fn settle() {
        // Lets the listener task drain its events.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_initial_value_then_updates() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(MemoryBackend::new());
        backend.put("scores/alice", json!(10)).await.unwrap();

        let listener = Arc::new(RecordingListener::default());
        let registration = spawn_value_listener(
            Arc::clone(&backend),
            "scores/alice".to_string(),
            Some("alice".to_string()),
            listener.clone(),
        );
        settle().await;

        backend.put("scores/alice", json!(11)).await.unwrap();
        settle().await;

        let values = listener.values.lock().unwrap().clone();
        assert_eq!(values, vec![json!(10), json!(11)]);
        registration.remove().await;
    }

    #[tokio::test]
    async fn test_unrelated_writes_are_ignored() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(MemoryBackend::new());
        let listener = Arc::new(RecordingListener::default());
        let registration = spawn_value_listener(
            Arc::clone(&backend),
            "scores/alice".to_string(),
            Some("alice".to_string()),
            listener.clone(),
        );
        settle().await;

        backend.put("scores/bob", json!(99)).await.unwrap();
        settle().await;

        // Only the initial (null) delivery.
        assert_eq!(listener.values.lock().unwrap().len(), 1);
        registration.remove().await;
    }

    #[tokio::test]
    async fn test_ancestor_write_notifies() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(MemoryBackend::new());
        let listener = Arc::new(RecordingListener::default());
        let registration = spawn_value_listener(
            Arc::clone(&backend),
            "scores/alice".to_string(),
            Some("alice".to_string()),
            listener.clone(),
        );
        settle().await;

        backend
            .put("scores", json!({ "alice": 5, "bob": 7 }))
            .await
            .unwrap();
        settle().await;

        let values = listener.values.lock().unwrap().clone();
        assert_eq!(values, vec![Value::Null, json!(5)]);
        registration.remove().await;
    }

    #[tokio::test]
    async fn test_remove_stops_delivery() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(MemoryBackend::new());
        let listener = Arc::new(RecordingListener::default());
        let registration = spawn_value_listener(
            Arc::clone(&backend),
            "scores/alice".to_string(),
            Some("alice".to_string()),
            listener.clone(),
        );
        settle().await;
        registration.remove().await;
        settle().await;

        backend.put("scores/alice", json!(42)).await.unwrap();
        settle().await;

        assert_eq!(listener.values.lock().unwrap().len(), 1);
        assert!(listener.cancellations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_close_cancels() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(MemoryBackend::new());
        let listener = Arc::new(RecordingListener::default());
        let _registration = spawn_value_listener(
            Arc::clone(&backend),
            "scores/alice".to_string(),
            Some("alice".to_string()),
            listener.clone(),
        );
        settle().await;

        backend.close().await;
        settle().await;

        let codes = listener.cancellations.lock().unwrap().clone();
        assert_eq!(codes, vec![DatabaseError::Disconnected.code()]);
    }
}
