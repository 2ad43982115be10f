//! Settings/secret store seam.
//!
//! The IDE side persists preferences and secrets in its own secure store;
//! this crate consumes that store through `SettingsStore` and ships a plain
//! JSON-file implementation for the CLI.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::errors::Result;

/// Keys the lifecycle manager reads and writes.
pub const KEY_PROXY_RUNNING: &str = "proxy.running";
pub const KEY_SELECTED_BRANCH: &str = "proxy.selected_branch";
pub const KEY_SELECTED_DRIVER: &str = "proxy.selected_driver";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// JSON-object file store. Writes go through a whole-file rewrite; the file is
/// small and this code path is rare.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    pub fn open(path: &Path) -> Result<FileSettingsStore> {
        let mut map = BTreeMap::new();
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&raw) {
                for (k, v) in obj {
                    if let Value::String(s) = v {
                        map.insert(k, s);
                    }
                }
            }
        }
        Ok(FileSettingsStore {
            path: path.to_path_buf(),
            cache: Mutex::new(map),
        })
    }

    fn flush(&self, map: &BTreeMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(serialized) = serde_json::to_string_pretty(map) {
            let _ = fs::write(&self.path, serialized);
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.cache.lock() {
            map.insert(key.to_string(), value.to_string());
            self.flush(&map);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.cache.lock() {
            map.remove(key);
            self.flush(&map);
        }
    }
}
