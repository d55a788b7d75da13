//! Mutable view handed to transaction closures
//!
//! A [`MutableData`] wraps the working copy of one location for the duration
//! of a single transaction attempt. The closure inspects and edits it in
//! place; if the attempt conflicts, the runner throws the copy away and the
//! next attempt starts from a fresh one, so edits never leak between
//! attempts.

use serde_json::{Map, Value};

use crate::database::value::{self, PRIORITY_KEY, VALUE_KEY};

/// The value and priority at one location during one transaction attempt
///
/// Navigating to a child borrows the view mutably, so edits made through the
/// child are visible to the parent. Keys are not re-validated here; the
/// reference layer validates paths before a transaction starts.
pub struct MutableData<'a> {
    node: &'a mut Value,
    key: Option<String>,
}

impl<'a> MutableData<'a> {
    pub(crate) fn new(node: &'a mut Value, key: Option<String>) -> Self {
        MutableData { node, key }
    }

    /// Key naming this location under its parent; `None` at the root of the
    /// transaction when it runs against the database root
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Current value at this location, without priorities; `null` when none
    pub fn value(&self) -> Value {
        value::strip(self.node)
    }

    /// Priority at this location; `null` when none is set
    pub fn priority(&self) -> Value {
        value::priority_of(self.node)
    }

    /// Replace the value at this location, keeping its priority
    pub fn set_value(&mut self, new_value: impl Into<Value>) {
        value::replace_value(self.node, new_value.into());
    }

    /// Set or clear (`null`) the priority at this location
    pub fn set_priority(&mut self, priority: impl Into<Value>) {
        value::replace_priority(self.node, priority.into());
    }

    /// View of the child at `path`, materializing intermediate maps so the
    /// child can be written to
    pub fn child(&mut self, path: &str) -> MutableData<'_> {
        let mut current: &mut Value = self.node;
        let mut key = self.key.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let map = as_map(current);
            current = map.entry(segment.to_string()).or_insert(Value::Null);
            key = Some(segment.to_string());
        }
        MutableData { node: current, key }
    }

    /// Whether a non-null value exists at the given relative path
    pub fn has_child(&self, path: &str) -> bool {
        let mut current: &Value = self.node;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match current {
                Value::Object(map) if !map.contains_key(VALUE_KEY) => {
                    match map.get(segment) {
                        Some(child) => current = child,
                        None => return false,
                    }
                }
                _ => return false,
            }
        }
        !value::strip(current).is_null()
    }

    /// Number of immediate children
    pub fn children_count(&self) -> usize {
        value::child_entries(self.node).len()
    }

    /// Mutable views of every immediate child
    pub fn children(&mut self) -> Vec<MutableData<'_>> {
        match self.node {
            Value::Object(map) if !map.contains_key(VALUE_KEY) => map
                .iter_mut()
                .filter(|(key, _)| !key.starts_with('.'))
                .map(|(key, node)| MutableData {
                    node,
                    key: Some(key.clone()),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for MutableData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableData")
            .field("key", &self.key)
            .field("value", &self.value())
            .field("priority", &self.priority())
            .finish()
    }
}

// Turn the node into a plain map to descend through, keeping its priority.
fn as_map(node: &mut Value) -> &mut Map<String, Value> {
    let is_plain_map = matches!(node, Value::Object(map) if !map.contains_key(VALUE_KEY));
    if !is_plain_map {
        let priority = value::priority_of(node);
        let mut map = Map::new();
        if !priority.is_null() {
            map.insert(PRIORITY_KEY.to_string(), priority);
        }
        *node = Value::Object(map);
    }
    match node {
        Value::Object(map) => map,
        // node was assigned an object above
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_and_priority_views() {
        let mut node = value::with_priority(json!(5), json!(2));
        let data = MutableData::new(&mut node, Some("count".to_string()));

        assert_eq!(data.key(), Some("count"));
        assert_eq!(data.value(), json!(5));
        assert_eq!(data.priority(), json!(2));
    }

    #[test]
    fn test_set_value_keeps_priority() {
        let mut node = value::with_priority(json!(5), json!(2));
        let mut data = MutableData::new(&mut node, None);

        data.set_value(6);
        assert_eq!(data.value(), json!(6));
        assert_eq!(data.priority(), json!(2));

        data.set_priority(Value::Null);
        assert_eq!(data.priority(), Value::Null);
        assert_eq!(node, json!(6));
    }

    #[test]
    fn test_child_edits_are_visible_to_the_parent() {
        let mut node = Value::Null;
        let mut data = MutableData::new(&mut node, None);

        data.child("users/alice").set_value(json!({"age": 30}));
        assert!(data.has_child("users/alice/age"));
        assert_eq!(
            data.value(),
            json!({"users": {"alice": {"age": 30}}})
        );
        assert_eq!(node, json!({"users": {"alice": {"age": 30}}}));
    }

    #[test]
    fn test_child_through_leaf_replaces_it() {
        let mut node = value::with_priority(json!(1), json!(9));
        let mut data = MutableData::new(&mut node, None);

        data.child("sub").set_value(2);
        assert_eq!(data.value(), json!({"sub": 2}));
        // The leaf's priority survives the conversion to a map.
        assert_eq!(data.priority(), json!(9));
    }

    #[test]
    fn test_children_enumeration() {
        let mut node = json!({"a": 1, "b": 2, ".priority": 7});
        let mut data = MutableData::new(&mut node, None);

        assert_eq!(data.children_count(), 2);
        let mut keys: Vec<String> = data
            .children()
            .iter()
            .filter_map(|child| child.key().map(str::to_string))
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        for mut child in data.children() {
            child.set_value(0);
        }
        assert_eq!(data.value(), json!({"a": 0, "b": 0}));
    }

    #[test]
    fn test_leaf_has_no_children() {
        let mut node = json!(42);
        let mut data = MutableData::new(&mut node, None);

        assert_eq!(data.children_count(), 0);
        assert!(data.children().is_empty());
        assert!(!data.has_child("anything"));
    }
}
