//! Immutable snapshot of one database location

use serde_json::Value;

use crate::database::value::{self, VALUE_KEY};

/// Point-in-time view of the value, priority and children at one location
///
/// Snapshots are plain data: cloning is cheap relative to the subtree size
/// and navigation never touches the backend.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    key: Option<String>,
    node: Value,
}

impl DataSnapshot {
    pub(crate) fn new(key: Option<String>, node: Value) -> Self {
        DataSnapshot { key, node }
    }

    /// Key naming this location under its parent; `None` at the root
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Value at this location, without priorities; `null` when none exists
    pub fn value(&self) -> Value {
        value::strip(&self.node)
    }

    /// Priority at this location; `null` when none is set
    pub fn priority(&self) -> Value {
        value::priority_of(&self.node)
    }

    /// Whether a non-null value exists here
    pub fn exists(&self) -> bool {
        !self.value().is_null()
    }

    /// Snapshot of the child at the given relative path
    ///
    /// Navigating to a missing child yields a snapshot that does not
    /// [`exist`](DataSnapshot::exists) rather than an error.
    pub fn child(&self, path: &str) -> DataSnapshot {
        let mut current: &Value = &self.node;
        let mut key = self.key.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            key = Some(segment.to_string());
            current = match current {
                Value::Object(map) if !map.contains_key(VALUE_KEY) => {
                    match map.get(segment) {
                        Some(child) => child,
                        None => return DataSnapshot::new(key, Value::Null),
                    }
                }
                _ => return DataSnapshot::new(key, Value::Null),
            };
        }
        DataSnapshot::new(key, current.clone())
    }

    /// Whether a non-null value exists at the given relative path
    pub fn has_child(&self, path: &str) -> bool {
        self.child(path).exists()
    }

    /// Number of immediate children
    pub fn children_count(&self) -> usize {
        value::child_entries(&self.node).len()
    }

    /// Snapshots of every immediate child
    pub fn children(&self) -> Vec<DataSnapshot> {
        value::child_entries(&self.node)
            .into_iter()
            .map(|(key, node)| DataSnapshot::new(Some(key), node))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_views() {
        let node = json!({
            "count": {".value": 5, ".priority": 2},
            "name": "counter"
        });
        let snapshot = DataSnapshot::new(None, node);

        assert!(snapshot.exists());
        assert_eq!(snapshot.value(), json!({"count": 5, "name": "counter"}));
        assert_eq!(snapshot.children_count(), 2);

        let count = snapshot.child("count");
        assert_eq!(count.key(), Some("count"));
        assert_eq!(count.value(), json!(5));
        assert_eq!(count.priority(), json!(2));
    }

    #[test]
    fn test_missing_child_does_not_exist() {
        let snapshot = DataSnapshot::new(None, json!({"a": 1}));

        let missing = snapshot.child("b/c");
        assert!(!missing.exists());
        assert_eq!(missing.key(), Some("c"));
        assert_eq!(missing.value(), Value::Null);

        assert!(snapshot.has_child("a"));
        assert!(!snapshot.has_child("b"));
    }

    #[test]
    fn test_children_carry_their_keys() {
        let snapshot = DataSnapshot::new(None, json!({"x": 1, "y": 2}));
        let mut keys: Vec<String> = snapshot
            .children()
            .iter()
            .filter_map(|child| child.key().map(str::to_string))
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
    }

    #[test]
    fn test_null_snapshot() {
        let snapshot = DataSnapshot::new(Some("ghost".to_string()), Value::Null);
        assert!(!snapshot.exists());
        assert_eq!(snapshot.children_count(), 0);
        assert!(snapshot.children().is_empty());
    }
}
