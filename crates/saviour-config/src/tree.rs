//! The nested config tree and dotted-path operations on it.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::ConfigError;

/// A nested mapping from dotted key paths to scalars, lists or objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Map<String, Value>,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(root) => Some(Self { root }),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// A key path is read-only when any of its segments begins with `_`.
    pub fn is_read_only(path: &str) -> bool {
        path.split('.').any(|seg| seg.starts_with('_'))
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: &Value = self.root.get(path.split('.').next()?)?;
        for segment in path.split('.').skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set `path` to `value`, creating intermediate objects as needed.
    /// Does not enforce read-only keys; that policy lives in the store.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ConfigError> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::EmptyPath);
        }
        let mut current = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry
                .as_object_mut()
                .ok_or_else(|| ConfigError::NotAnObject(path.to_string()))?;
        }
        current.insert(segments[segments.len() - 1].to_string(), value);
        Ok(())
    }

    /// Deep merge: values in `override_tree` replace values here;
    /// objects merge recursively.
    pub fn merge_over(&mut self, override_tree: &ConfigTree) {
        merge_objects(&mut self.root, &override_tree.root);
    }

    /// Fill-missing merge: copy defaults only for keys not already
    /// present; existing values are never overwritten.
    pub fn fill_missing(&mut self, defaults: &ConfigTree) {
        fill_objects(&mut self.root, &defaults.root);
    }

    /// Dotted paths of every leaf that differs between `self` and
    /// `other`, whether added, removed or changed.
    pub fn diff_paths(&self, other: &ConfigTree) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        diff_objects(&self.root, &other.root, String::new(), &mut out);
        out
    }

    /// All leaf paths in the tree, dotted.
    pub fn leaf_paths(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_leaves(&self.root, String::new(), &mut out);
        out
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn merge_objects(base: &mut Map<String, Value>, over: &Map<String, Value>) {
    for (key, value) in over {
        match (base.get_mut(key), value) {
            (Some(Value::Object(b)), Value::Object(o)) => merge_objects(b, o),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn fill_objects(target: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    for (key, value) in defaults {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), value.clone());
            }
            Some(Value::Object(t)) => {
                if let Value::Object(d) = value {
                    fill_objects(t, d);
                }
            }
            Some(_) => {}
        }
    }
}

fn diff_objects(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    prefix: String,
    out: &mut BTreeSet<String>,
) {
    for (key, av) in a {
        let path = join(&prefix, key);
        match b.get(key) {
            None => collect_value_leaves(av, &path, out),
            Some(bv) => diff_values(av, bv, path, out),
        }
    }
    for (key, bv) in b {
        if !a.contains_key(key) {
            collect_value_leaves(bv, &join(&prefix, key), out);
        }
    }
}

fn diff_values(a: &Value, b: &Value, path: String, out: &mut BTreeSet<String>) {
    match (a, b) {
        (Value::Object(ao), Value::Object(bo)) => diff_objects(ao, bo, path, out),
        _ => {
            if a != b {
                out.insert(path);
            }
        }
    }
}

fn collect_value_leaves(value: &Value, path: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                out.insert(path.to_string());
            } else {
                for (key, v) in map {
                    collect_value_leaves(v, &join(path, key), out);
                }
            }
        }
        _ => {
            out.insert(path.to_string());
        }
    }
}

fn collect_leaves(map: &Map<String, Value>, prefix: String, out: &mut BTreeSet<String>) {
    for (key, value) in map {
        let path = join(&prefix, key);
        match value {
            Value::Object(inner) if !inner.is_empty() => collect_leaves(inner, path, out),
            _ => {
                out.insert(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> ConfigTree {
        ConfigTree::from_value(value).unwrap()
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut t = ConfigTree::new();
        t.set("camera.fps", json!(25)).unwrap();
        t.set("camera.resolution.width", json!(1920)).unwrap();
        assert_eq!(t.get("camera.fps"), Some(&json!(25)));
        assert_eq!(t.get("camera.resolution.width"), Some(&json!(1920)));
        assert_eq!(t.get("camera.missing"), None);
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut t = tree(json!({"camera": {"fps": 25}}));
        let err = t.set("camera.fps.sub", json!(1)).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject(_)));
    }

    #[test]
    fn test_read_only_detection() {
        assert!(ConfigTree::is_read_only("network._zeroconf_port"));
        assert!(ConfigTree::is_read_only("_internal"));
        assert!(ConfigTree::is_read_only("export._share_ip"));
        assert!(!ConfigTree::is_read_only("export.max_bitrate_mb"));
    }

    #[test]
    fn test_merge_over_deep() {
        let mut base = tree(json!({"a": {"x": 1, "y": 2}, "b": 3}));
        let over = tree(json!({"a": {"y": 9}, "c": 4}));
        base.merge_over(&over);
        assert_eq!(base.get("a.x"), Some(&json!(1)));
        assert_eq!(base.get("a.y"), Some(&json!(9)));
        assert_eq!(base.get("b"), Some(&json!(3)));
        assert_eq!(base.get("c"), Some(&json!(4)));
    }

    #[test]
    fn test_fill_missing_never_overwrites() {
        let mut active = tree(json!({"camera": {"fps": 60}}));
        let defaults = tree(json!({"camera": {"fps": 25, "codec": "h264"}}));
        active.fill_missing(&defaults);
        assert_eq!(active.get("camera.fps"), Some(&json!(60)));
        assert_eq!(active.get("camera.codec"), Some(&json!("h264")));
    }

    #[test]
    fn test_diff_paths() {
        let a = tree(json!({"camera": {"fps": 25, "codec": "h264"}, "group": "g1"}));
        let b = tree(json!({"camera": {"fps": 60, "codec": "h264"}, "extra": 1}));
        let diff = a.diff_paths(&b);
        assert!(diff.contains("camera.fps"));
        assert!(diff.contains("group"));
        assert!(diff.contains("extra"));
        assert!(!diff.contains("camera.codec"));
    }

    #[test]
    fn test_diff_of_identical_trees_is_empty() {
        let a = tree(json!({"x": {"y": [1, 2, 3]}}));
        assert!(a.diff_paths(&a.clone()).is_empty());
    }

    #[test]
    fn test_leaf_paths() {
        let t = tree(json!({"a": {"b": 1}, "c": true}));
        let leaves = t.leaf_paths();
        assert_eq!(
            leaves.into_iter().collect::<Vec<_>>(),
            vec!["a.b".to_string(), "c".to_string()]
        );
    }
}
