//! Storage seam behind the database surface
//!
//! [`DatabaseBackend`] models the server side of the database: snapshot
//! reads, plain writes, and the conditional commit the transaction runner
//! builds on. The SDK ships [`MemoryBackend`], a versioned in-process tree;
//! embedders (and tests) can substitute their own implementation, e.g. to
//! inject conflicting writers.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::database::value;
use crate::error::DatabaseError;

/// A node read together with the tree version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedNode {
    /// Stored node in export format (dot-keys carry priorities)
    pub node: Value,
    /// Tree version observed by this read
    pub version: u64,
}

/// Outcome of a conditional commit
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write landed; the tree is now at this version
    Committed(u64),
    /// A concurrent write got there first; the current state at the target
    /// location is returned for the caller's next attempt
    Conflict(VersionedNode),
}

/// Change notification fanned out to value listeners
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A write committed at `path`
    Write {
        /// Location the write targeted
        path: String,
        /// Tree version after the write
        version: u64,
    },
    /// The backend shut down; no further events follow
    Closed,
}

/// Server-side contract of the realtime database
///
/// Commit ordering is first-committer-wins: `compare_and_set` succeeds only
/// if no write committed after `expected_version`. Conflict detection is
/// tree-global and therefore conservative; a false conflict only costs the
/// caller another attempt against fresh state.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Read the node at `path` with the current tree version
    async fn fetch(&self, path: &str) -> Result<VersionedNode, DatabaseError>;

    /// Commit `node` at `path` if the tree is still at `expected_version`
    async fn compare_and_set(
        &self,
        path: &str,
        expected_version: u64,
        node: Value,
    ) -> Result<CasOutcome, DatabaseError>;

    /// Unconditionally write `node` at `path`; returns the new tree version
    async fn put(&self, path: &str, node: Value) -> Result<u64, DatabaseError>;

    /// Apply several relative writes under `path` as one version step
    async fn merge(
        &self,
        path: &str,
        updates: HashMap<String, Value>,
    ) -> Result<u64, DatabaseError>;

    /// Set or clear the priority of the existing node at `path`
    ///
    /// Ignored when no value is stored there; a priority cannot exist
    /// without a value.
    async fn set_priority(&self, path: &str, priority: Value) -> Result<u64, DatabaseError>;

    /// Subscribe to committed changes
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Shut the backend down: fail subsequent operations with
    /// [`DatabaseError::Disconnected`] and notify subscribers
    async fn close(&self);
}

struct TreeState {
    root: Value,
    version: u64,
    closed: bool,
}

/// In-process implementation of [`DatabaseBackend`]
///
/// Holds one export-format tree and a monotonically increasing version that
/// every committed write bumps.
pub struct MemoryBackend {
    state: RwLock<TreeState>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryBackend {
    /// Create an empty tree at version 0
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        MemoryBackend {
            state: RwLock::new(TreeState {
                root: Value::Null,
                version: 0,
                closed: false,
            }),
            changes,
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, path: &str, version: u64) {
        let _ = self.changes.send(ChangeEvent::Write {
            path: path.trim_matches('/').to_string(),
            version,
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseBackend for MemoryBackend {
    async fn fetch(&self, path: &str) -> Result<VersionedNode, DatabaseError> {
        let segments = value::split_path(path)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(DatabaseError::Disconnected);
        }
        Ok(VersionedNode {
            node: value::get_at(&state.root, &segments)
                .cloned()
                .unwrap_or(Value::Null),
            version: state.version,
        })
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected_version: u64,
        node: Value,
    ) -> Result<CasOutcome, DatabaseError> {
        let segments = value::split_path(path)?;
        let mut state = self.write_state();
        if state.closed {
            return Err(DatabaseError::Disconnected);
        }
        if state.version != expected_version {
            // First committer wins; hand back fresh state for the retry.
            return Ok(CasOutcome::Conflict(VersionedNode {
                node: value::get_at(&state.root, &segments)
                    .cloned()
                    .unwrap_or(Value::Null),
                version: state.version,
            }));
        }
        value::write_at(&mut state.root, &segments, node);
        state.version += 1;
        let version = state.version;
        drop(state);

        self.notify(path, version);
        Ok(CasOutcome::Committed(version))
    }

    async fn put(&self, path: &str, node: Value) -> Result<u64, DatabaseError> {
        let segments = value::split_path(path)?;
        let mut state = self.write_state();
        if state.closed {
            return Err(DatabaseError::Disconnected);
        }
        value::write_at(&mut state.root, &segments, node);
        state.version += 1;
        let version = state.version;
        drop(state);

        self.notify(path, version);
        Ok(version)
    }

    async fn merge(
        &self,
        path: &str,
        updates: HashMap<String, Value>,
    ) -> Result<u64, DatabaseError> {
        // Validate every target before touching the tree.
        let mut writes = Vec::with_capacity(updates.len());
        for (relative, node) in updates {
            let target = value::join_path(path, &relative);
            writes.push((value::split_path(&target)?, node));
        }

        let mut state = self.write_state();
        if state.closed {
            return Err(DatabaseError::Disconnected);
        }
        for (segments, node) in writes {
            value::write_at(&mut state.root, &segments, node);
        }
        state.version += 1;
        let version = state.version;
        drop(state);

        self.notify(path, version);
        Ok(version)
    }

    async fn set_priority(&self, path: &str, priority: Value) -> Result<u64, DatabaseError> {
        let segments = value::split_path(path)?;
        let mut state = self.write_state();
        if state.closed {
            return Err(DatabaseError::Disconnected);
        }
        let Some(node) = value::get_at(&state.root, &segments) else {
            // No value, nothing to prioritize.
            return Ok(state.version);
        };
        let mut node = node.clone();
        value::replace_priority(&mut node, priority);
        value::write_at(&mut state.root, &segments, node);
        state.version += 1;
        let version = state.version;
        drop(state);

        self.notify(path, version);
        Ok(version)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn close(&self) {
        {
            let mut state = self.write_state();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!("memory backend closed");
        let _ = self.changes.send(ChangeEvent::Closed);
    }
}
