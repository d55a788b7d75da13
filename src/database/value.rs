//! Tree representation shared by the database surface
//!
//! Stored nodes use the export format: a leaf with a priority becomes
//! `{".value": v, ".priority": p}`, a map with a priority carries an inline
//! `".priority"` entry. Dot-keys never leak out of this module; snapshots and
//! mutable views strip them on read and re-attach them on write.
//!
//! `null` means absent: writing `null` deletes a subtree and empty maps are
//! pruned away, so a location either holds a meaningful value or does not
//! exist at all.

use serde_json::{Map, Value};

use crate::error::DatabaseError;

pub(crate) const VALUE_KEY: &str = ".value";
pub(crate) const PRIORITY_KEY: &str = ".priority";

/// Split a slash-separated location path into validated segments
///
/// Leading and trailing slashes are ignored; the root path is empty. Segment
/// characters follow the platform key rules.
pub(crate) fn split_path(path: &str) -> Result<Vec<String>, DatabaseError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            return Err(DatabaseError::InvalidPath(format!(
                "empty segment in '{}'",
                path
            )));
        }
        if segment
            .chars()
            .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']'))
        {
            return Err(DatabaseError::InvalidPath(format!(
                "segment '{}' contains a forbidden character",
                segment
            )));
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

/// Join two path fragments, tolerating surrounding slashes
pub(crate) fn join_path(base: &str, child: &str) -> String {
    let base = base.trim_matches('/');
    let child = child.trim_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, child),
    }
}

/// Whether a write at `a` is visible from a location at `b` (ancestor,
/// descendant or equal)
pub(crate) fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_matches('/');
    let b = b.trim_matches('/');
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.split('/')
        .zip(b.split('/'))
        .all(|(left, right)| left == right)
}

/// Public value view of a stored node: dot-keys removed at every depth
pub(crate) fn strip(node: &Value) -> Value {
    match node {
        Value::Object(map) => {
            if let Some(leaf) = map.get(VALUE_KEY) {
                return strip(leaf);
            }
            let children: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !key.starts_with('.'))
                .map(|(key, child)| (key.clone(), strip(child)))
                .collect();
            if children.is_empty() {
                Value::Null
            } else {
                Value::Object(children)
            }
        }
        other => other.clone(),
    }
}

/// Priority stored on a node; `null` when none is set
pub(crate) fn priority_of(node: &Value) -> Value {
    node.get(PRIORITY_KEY).cloned().unwrap_or(Value::Null)
}

/// Attach a priority to a plain value, producing a storable node
pub(crate) fn with_priority(value: Value, priority: Value) -> Value {
    if priority.is_null() {
        return value;
    }
    match value {
        Value::Object(mut map) => {
            map.insert(PRIORITY_KEY.to_string(), priority);
            Value::Object(map)
        }
        leaf => {
            let mut map = Map::new();
            map.insert(VALUE_KEY.to_string(), leaf);
            map.insert(PRIORITY_KEY.to_string(), priority);
            Value::Object(map)
        }
    }
}

/// Replace the value portion of a node in place, preserving its priority
pub(crate) fn replace_value(node: &mut Value, new_value: Value) {
    let priority = priority_of(node);
    *node = with_priority(new_value, priority);
}

/// Set or clear the priority of a node in place
pub(crate) fn replace_priority(node: &mut Value, priority: Value) {
    let value = strip(node);
    *node = with_priority(value, priority);
}

/// Whether a node holds no meaningful value (and should be pruned)
pub(crate) fn is_empty_node(node: &Value) -> bool {
    match node {
        Value::Null => true,
        Value::Object(map) => !map
            .keys()
            .any(|key| !key.starts_with('.') || key == VALUE_KEY),
        _ => false,
    }
}

/// Child entries of a node, skipping dot-keys
pub(crate) fn child_entries(node: &Value) -> Vec<(String, Value)> {
    match node {
        Value::Object(map) if !map.contains_key(VALUE_KEY) => map
            .iter()
            .filter(|(key, _)| !key.starts_with('.'))
            .map(|(key, child)| (key.clone(), child.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Borrow the node at `segments`, if it exists
pub(crate) fn get_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        match current {
            Value::Object(map) if !map.contains_key(VALUE_KEY) => {
                current = map.get(segment)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Write `node` at `segments`, pruning deleted and emptied subtrees
pub(crate) fn write_at(root: &mut Value, segments: &[String], node: Value) {
    if segments.is_empty() {
        *root = normalize(node);
        return;
    }

    // Descending through a leaf replaces it with a map, keeping its priority.
    if !matches!(root, Value::Object(map) if !map.contains_key(VALUE_KEY)) {
        let priority = priority_of(root);
        let mut map = Map::new();
        if !priority.is_null() {
            map.insert(PRIORITY_KEY.to_string(), priority);
        }
        *root = Value::Object(map);
    }

    let map = match root {
        Value::Object(map) => map,
        _ => unreachable!("root was just normalized to a map"),
    };
    let child = map.entry(segments[0].clone()).or_insert(Value::Null);
    write_at(child, &segments[1..], node);

    if is_empty_node(child) {
        map.remove(&segments[0]);
    }
    if !map.keys().any(|key| !key.starts_with('.')) {
        // A subtree keeping only its priority no longer holds a value.
        *root = Value::Null;
    }
}

/// Normalize a node for storage: drop null children, collapse empty maps to
/// null, and unwrap a dot-leaf whose priority disappeared
pub(crate) fn normalize(node: Value) -> Value {
    match node {
        Value::Object(map) => {
            let mut normalized = Map::new();
            for (key, child) in map {
                let child = if key.starts_with('.') {
                    child
                } else {
                    normalize(child)
                };
                if !child.is_null() {
                    normalized.insert(key, child);
                }
            }
            if normalized.contains_key(VALUE_KEY) {
                if normalized.len() == 1 {
                    // The priority is gone; unwrap the bare leaf.
                    return normalized.remove(VALUE_KEY).unwrap_or(Value::Null);
                }
                return Value::Object(normalized);
            }
            if !normalized.keys().any(|key| !key.starts_with('.')) {
                return Value::Null;
            }
            Value::Object(normalized)
        }
        other => other,
    }
}

/// Whether `priority` is a legal priority value: null, a number or a string
pub(crate) fn valid_priority(priority: &Value) -> bool {
    priority.is_null() || priority.is_number() || priority.is_string()
}

/// Check that a caller-supplied node can be stored
///
/// Nested map keys follow the same character rules as path segments; the
/// `.value`/`.priority` pair is allowed and its priority must be legal.
pub(crate) fn validate_writable(node: &Value) -> Result<(), DatabaseError> {
    let Value::Object(map) = node else {
        return Ok(());
    };
    for (key, child) in map {
        match key.as_str() {
            VALUE_KEY => validate_writable(child)?,
            PRIORITY_KEY => {
                if !valid_priority(child) {
                    return Err(DatabaseError::InvalidValue(
                        "priority must be null, a number or a string".to_string(),
                    ));
                }
            }
            _ => {
                if key.is_empty()
                    || key
                        .chars()
                        .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']' | '/'))
                {
                    return Err(DatabaseError::InvalidValue(format!(
                        "key '{}' contains a forbidden character",
                        key
                    )));
                }
                validate_writable(child)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(path: &str) -> Vec<String> {
        split_path(path).expect("valid path")
    }

    #[test]
    fn test_split_path() {
        assert!(segs("").is_empty());
        assert!(segs("/").is_empty());
        assert_eq!(segs("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(segs("/users/alice/"), vec!["users", "alice"]);

        assert!(split_path("a//b").is_err());
        assert!(split_path("a/b.c").is_err());
        assert!(split_path("a/$id").is_err());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a/b"), "a/b");
        assert_eq!(join_path("a", ""), "a");
        assert_eq!(join_path("a/", "/b"), "a/b");
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap("", "a/b"));
        assert!(paths_overlap("a/b", "a"));
        assert!(paths_overlap("a", "a/b/c"));
        assert!(paths_overlap("a/b", "a/b"));
        assert!(!paths_overlap("a/b", "a/c"));
        assert!(!paths_overlap("x", "y"));
    }

    #[test]
    fn test_strip_removes_dot_keys_at_depth() {
        let node = json!({
            "count": {".value": 5, ".priority": 2},
            "meta": {".priority": 1, "name": "x"}
        });
        assert_eq!(strip(&node), json!({"count": 5, "meta": {"name": "x"}}));
    }

    #[test]
    fn test_priority_round_trip() {
        let node = with_priority(json!(5), json!(3));
        assert_eq!(priority_of(&node), json!(3));
        assert_eq!(strip(&node), json!(5));

        let map_node = with_priority(json!({"a": 1}), json!("p"));
        assert_eq!(priority_of(&map_node), json!("p"));
        assert_eq!(strip(&map_node), json!({"a": 1}));
    }

    #[test]
    fn test_replace_value_preserves_priority() {
        let mut node = with_priority(json!(5), json!(9));
        replace_value(&mut node, json!(6));
        assert_eq!(strip(&node), json!(6));
        assert_eq!(priority_of(&node), json!(9));
    }

    #[test]
    fn test_replace_priority_preserves_value() {
        let mut node = json!({"a": 1});
        replace_priority(&mut node, json!(4));
        assert_eq!(strip(&node), json!({"a": 1}));
        assert_eq!(priority_of(&node), json!(4));

        replace_priority(&mut node, Value::Null);
        assert_eq!(node, json!({"a": 1}));
    }

    #[test]
    fn test_get_at_navigation() {
        let root = json!({"users": {"alice": {"age": 30}}});
        assert_eq!(get_at(&root, &segs("users/alice/age")), Some(&json!(30)));
        assert_eq!(get_at(&root, &segs("users/bob")), None);
        assert_eq!(get_at(&root, &[]), Some(&root));

        // A dot-leaf has no navigable children.
        let leafy = json!({"n": {".value": 1, ".priority": 0}});
        assert_eq!(get_at(&leafy, &segs("n/x")), None);
    }

    #[test]
    fn test_write_at_creates_intermediate_maps() {
        let mut root = Value::Null;
        write_at(&mut root, &segs("a/b/c"), json!(1));
        assert_eq!(root, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_write_null_prunes_empty_parents() {
        let mut root = json!({"a": {"b": {"c": 1}}, "keep": true});
        write_at(&mut root, &segs("a/b/c"), Value::Null);
        assert_eq!(root, json!({"keep": true}));

        write_at(&mut root, &segs("keep"), Value::Null);
        assert_eq!(root, Value::Null);
    }

    #[test]
    fn test_write_through_leaf_keeps_its_priority() {
        let mut root = Value::Null;
        write_at(&mut root, &segs("node"), with_priority(json!(7), json!(1)));
        write_at(&mut root, &segs("node/child"), json!(2));

        let node = get_at(&root, &segs("node")).expect("node exists");
        assert_eq!(priority_of(node), json!(1));
        assert_eq!(strip(node), json!({"child": 2}));
    }

    #[test]
    fn test_normalize_collapses_empty_and_null() {
        assert_eq!(normalize(json!({})), Value::Null);
        assert_eq!(normalize(json!({"a": null})), Value::Null);
        assert_eq!(normalize(json!({".value": 5})), json!(5));
        assert_eq!(
            normalize(json!({"a": {"b": null}, "c": 1})),
            json!({"c": 1})
        );
    }

    #[test]
    fn test_child_entries_skip_dot_keys() {
        let node = json!({"a": 1, ".priority": 9, "b": 2});
        let mut keys: Vec<String> = child_entries(&node).into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(child_entries(&json!(5)).is_empty());
        assert!(child_entries(&json!({".value": 5, ".priority": 1})).is_empty());
    }

    #[test]
    fn test_validate_writable_checks_nested_keys() {
        assert!(validate_writable(&json!({"users": {"alice": {"score": 1}}})).is_ok());
        assert!(validate_writable(&json!({".value": 5, ".priority": "a"})).is_ok());
        assert!(validate_writable(&json!(42)).is_ok());

        assert!(validate_writable(&json!({"bad#key": 1})).is_err());
        assert!(validate_writable(&json!({"ok": {"als[o": 1}})).is_err());
        assert!(validate_writable(&json!({".value": 5, ".priority": true})).is_err());
    }

    #[test]
    fn test_valid_priority_kinds() {
        assert!(valid_priority(&Value::Null));
        assert!(valid_priority(&json!(3.5)));
        assert!(valid_priority(&json!("high")));
        assert!(!valid_priority(&json!(true)));
        assert!(!valid_priority(&json!({"nested": 1})));
    }
}
