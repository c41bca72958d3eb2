//! The config store: layered load, dotted-path access, change
//! notification, atomic persistence.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::tree::ConfigTree;
use crate::{ConfigError, ENV_OVERRIDES};

/// One change notification: the set of dotted key paths whose effective
/// value changed in a single mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDelta {
    pub changed: Vec<String>,
}

pub struct ConfigStore {
    base_path: PathBuf,
    active_path: PathBuf,
    tree: RwLock<ConfigTree>,
    events: broadcast::Sender<ConfigDelta>,
}

impl ConfigStore {
    /// Load the effective tree. If a persisted active config exists it
    /// wins over the base defaults; environment overrides are applied
    /// last, for the whitelisted keys only.
    pub fn load(base_path: impl AsRef<Path>, active_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = base_path.as_ref().to_path_buf();
        let active_path = active_path.as_ref().to_path_buf();

        let mut tree = if active_path.exists() {
            info!(path = %active_path.display(), "loading persisted active config");
            read_tree(&active_path)?
        } else {
            info!(path = %base_path.display(), "no active config, building from base defaults");
            read_tree(&base_path)?
        };

        apply_env_overrides(&mut tree, |name| std::env::var(name).ok());

        let (events, _) = broadcast::channel(32);
        let store = Self {
            base_path,
            active_path,
            tree: RwLock::new(tree),
            events,
        };
        store.save_active()?;
        Ok(store)
    }

    /// Merge module-type defaults in. If an active config was already
    /// persisted only missing keys are filled; on first run the defaults
    /// merge fully. Persists the result.
    pub fn load_module_defaults(
        &self,
        module_defaults_path: impl AsRef<Path>,
        had_active: bool,
    ) -> Result<(), ConfigError> {
        let path = module_defaults_path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "module defaults not found");
            return Ok(());
        }
        let defaults = read_tree(path)?;
        {
            let mut tree = self.tree.write().unwrap();
            if had_active {
                tree.fill_missing(&defaults);
            } else {
                tree.merge_over(&defaults);
            }
        }
        self.save_active()
    }

    /// Discard runtime changes: delete the active config and rebuild
    /// from base plus optional module defaults.
    pub fn reset_to_defaults(
        &self,
        module_defaults_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        if self.active_path.exists() {
            std::fs::remove_file(&self.active_path)?;
        }
        let mut fresh = read_tree(&self.base_path)?;
        if let Some(path) = module_defaults_path {
            if path.exists() {
                fresh.merge_over(&read_tree(path)?);
            }
        }
        apply_env_overrides(&mut fresh, |name| std::env::var(name).ok());

        let changed = {
            let mut tree = self.tree.write().unwrap();
            let changed: Vec<String> = tree.diff_paths(&fresh).into_iter().collect();
            *tree = fresh;
            changed
        };
        self.save_active()?;
        if !changed.is_empty() {
            let _ = self.events.send(ConfigDelta { changed });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigDelta> {
        self.events.subscribe()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.tree.read().unwrap().get(path).cloned()
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.get(path)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        match self.get(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path)?.as_bool()
    }

    pub fn get_all(&self) -> Value {
        self.tree.read().unwrap().as_value()
    }

    /// Set one key. Read-only keys are rejected with no state change.
    /// Emits the set of leaf paths that actually changed.
    pub fn set(&self, path: &str, value: Value, persist: bool) -> Result<(), ConfigError> {
        let mut updates = serde_json::Map::new();
        updates.insert(path.to_string(), value);
        self.apply(&updates, persist).map(|_| ())
    }

    /// Apply a batch of dotted-path assignments, computing the diff
    /// against the current tree and emitting it as one event. Rejects
    /// the whole batch if any key (or any leaf it would change) is
    /// read-only.
    pub fn set_all(&self, updates: &serde_json::Map<String, Value>) -> Result<Vec<String>, ConfigError> {
        self.apply(updates, true)
    }

    fn apply(
        &self,
        updates: &serde_json::Map<String, Value>,
        persist: bool,
    ) -> Result<Vec<String>, ConfigError> {
        for path in updates.keys() {
            if ConfigTree::is_read_only(path) {
                return Err(ConfigError::ReadOnly(path.clone()));
            }
        }
        let changed = {
            let mut tree = self.tree.write().unwrap();
            let mut next = tree.clone();
            for (path, value) in updates {
                next.set(path, value.clone())?;
            }
            let changed: Vec<String> = tree.diff_paths(&next).into_iter().collect();
            // Assigning a parent object must not smuggle changes into
            // read-only leaves underneath it.
            if let Some(path) = changed.iter().find(|p| ConfigTree::is_read_only(p)) {
                return Err(ConfigError::ReadOnly(path.clone()));
            }
            *tree = next;
            changed
        };
        if persist {
            self.save_active()?;
        }
        if !changed.is_empty() {
            let _ = self.events.send(ConfigDelta {
                changed: changed.clone(),
            });
        }
        Ok(changed)
    }

    /// Write the merged effective tree to the active config path:
    /// temp file in the same directory, then rename.
    pub fn save_active(&self) -> Result<(), ConfigError> {
        let value = self.tree.read().unwrap().as_value();
        let text = serde_json::to_string_pretty(&value)?;
        let tmp = self.active_path.with_extension("json.tmp");
        if let Some(parent) = self.active_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.active_path)?;
        Ok(())
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }
}

fn read_tree(path: &Path) -> Result<ConfigTree, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    ConfigTree::from_value(value)
        .ok_or_else(|| ConfigError::NotAnObject(path.display().to_string()))
}

fn apply_env_overrides(tree: &mut ConfigTree, env: impl Fn(&str) -> Option<String>) {
    for (var, path) in ENV_OVERRIDES {
        if let Some(raw) = env(var) {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            // Env-whitelisted paths may include read-only keys; the
            // whitelist itself is the authorization.
            if let Err(e) = tree.set(path, value) {
                warn!(var, path, error = %e, "environment override failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_base(dir: &TempDir, value: Value) -> PathBuf {
        let path = dir.path().join("base_config.json");
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
        path
    }

    fn store(dir: &TempDir, base: Value) -> ConfigStore {
        let base_path = write_base(dir, base);
        let active_path = dir.path().join("active_config.json");
        ConfigStore::load(&base_path, &active_path).unwrap()
    }

    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"camera": {"fps": 25}}));
        store.set("camera.fps", json!(60), false).unwrap();
        assert_eq!(store.get("camera.fps"), Some(json!(60)));
    }

    #[test]
    fn test_read_only_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"network": {"_zeroconf_port": 5353}}));
        let err = store.set("network._zeroconf_port", json!(1), false).unwrap_err();
        assert!(matches!(err, ConfigError::ReadOnly(_)));
        assert_eq!(store.get("network._zeroconf_port"), Some(json!(5353)));
    }

    #[test]
    fn test_parent_write_cannot_change_read_only_leaf() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"network": {"_zeroconf_port": 5353, "iface": "eth0"}}));
        let err = store
            .set(
                "network",
                json!({"_zeroconf_port": 1, "iface": "eth1"}),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadOnly(_)));
        assert_eq!(store.get("network._zeroconf_port"), Some(json!(5353)));
        assert_eq!(store.get("network.iface"), Some(json!("eth0")));
    }

    #[test]
    fn test_set_all_roundtrip_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"a": 1, "b": {"c": 2}}));
        let all = store.get_all();
        let Value::Object(map) = all else { panic!() };
        // set_all(get_all()) as flat object of top-level keys
        let changed = store.set_all(&map).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn test_set_all_emits_single_delta() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"camera": {"fps": 25, "codec": "h264"}}));
        let mut rx = store.subscribe();

        let mut updates = serde_json::Map::new();
        updates.insert("camera.fps".to_string(), json!(60));
        updates.insert("camera.codec".to_string(), json!("h264"));
        let changed = store.set_all(&updates).unwrap();
        assert_eq!(changed, vec!["camera.fps".to_string()]);

        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.changed, vec!["camera.fps".to_string()]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_persisted_active_wins_over_base() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir, json!({"camera": {"fps": 25}}));
            store.set("camera.fps", json!(50), true).unwrap();
        }
        // Reload: active config carries the override.
        let base_path = dir.path().join("base_config.json");
        let active_path = dir.path().join("active_config.json");
        let reloaded = ConfigStore::load(&base_path, &active_path).unwrap();
        assert_eq!(reloaded.get("camera.fps"), Some(json!(50)));
    }

    #[test]
    fn test_save_is_atomic_no_tmp_left() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"a": 1}));
        store.set("a", json!(2), true).unwrap();
        assert!(dir.path().join("active_config.json").exists());
        assert!(!dir.path().join("active_config.json.tmp").exists());
    }

    #[test]
    fn test_fill_missing_module_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"camera": {"fps": 25}}));
        let module_path = dir.path().join("camera_config.json");
        std::fs::write(
            &module_path,
            serde_json::to_string(&json!({"camera": {"fps": 99, "codec": "h264"}})).unwrap(),
        )
        .unwrap();

        store.load_module_defaults(&module_path, true).unwrap();
        assert_eq!(store.get("camera.fps"), Some(json!(25)));
        assert_eq!(store.get("camera.codec"), Some(json!("h264")));
    }

    #[test]
    fn test_env_override_applied() {
        let mut tree = ConfigTree::from_value(json!({"communication": {}})).unwrap();
        apply_env_overrides(&mut tree, |name| {
            (name == "MODULE_CMD_PORT").then(|| "6001".to_string())
        });
        assert_eq!(
            tree.get("communication.command_socket_port"),
            Some(&json!(6001))
        );
    }

    #[test]
    fn test_reset_to_defaults_discards_overrides() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, json!({"camera": {"fps": 25}}));
        store.set("camera.fps", json!(90), true).unwrap();
        store.reset_to_defaults(None).unwrap();
        assert_eq!(store.get("camera.fps"), Some(json!(25)));
    }
}
