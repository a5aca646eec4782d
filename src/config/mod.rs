//! Broker configuration snapshot and attribute table
//!
//! The configuration object is an immutable snapshot from the broker's
//! point of view; each module thread is handed its own clone so it can
//! mutate its view without racing the broker. The attribute table carries
//! broker attributes; its immutable entries are copied into every module
//! handle's cache before the entry point runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::module::error::ModuleError;

/// Broker configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bound on the broker→module direction of each module channel.
    #[serde(default = "default_send_capacity")]
    pub module_send_capacity: usize,

    /// Directory searched when a module is loaded by bare name.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// How long a graceful unload waits for EXITED before canceling.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_send_capacity() -> usize {
    1000
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            module_send_capacity: default_send_capacity(),
            modules_dir: default_modules_dir(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
struct AttrEntry {
    value: String,
    immutable: bool,
}

/// Broker attribute table.
#[derive(Debug, Default)]
pub struct AttrTable {
    entries: Mutex<HashMap<String, AttrEntry>>,
}

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a mutable attribute. Fails if the name is already set
    /// immutable.
    pub fn set(&self, name: &str, value: &str) -> Result<(), ModuleError> {
        self.insert(name, value, false)
    }

    /// Set an attribute that never changes for the life of the broker.
    pub fn set_immutable(&self, name: &str, value: &str) -> Result<(), ModuleError> {
        self.insert(name, value, true)
    }

    fn insert(&self, name: &str, value: &str, immutable: bool) -> Result<(), ModuleError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(name) {
            if existing.immutable {
                return Err(ModuleError::Invalid(format!(
                    "attribute {name} is immutable"
                )));
            }
        }
        entries.insert(
            name.to_string(),
            AttrEntry {
                value: value.to_string(),
                immutable,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.value.clone())
    }

    /// Snapshot of the immutable entries, used to prime module attribute
    /// caches.
    pub fn immutables(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.immutable)
            .map(|(name, e)| (name.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let conf = BrokerConfig::default();
        assert_eq!(conf.module_send_capacity, 1000);
        assert_eq!(conf.modules_dir, PathBuf::from("modules"));
        assert_eq!(conf.shutdown_timeout_secs, 5);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let conf: BrokerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.module_send_capacity, 1000);
        let conf: BrokerConfig =
            serde_json::from_str(r#"{"module_send_capacity": 16}"#).unwrap();
        assert_eq!(conf.module_send_capacity, 16);
    }

    #[test]
    fn test_attr_immutability() {
        let attrs = AttrTable::new();
        attrs.set("log-level", "7").unwrap();
        attrs.set("log-level", "5").unwrap();
        attrs.set_immutable("rank", "0").unwrap();
        assert!(attrs.set("rank", "1").is_err());
        assert_eq!(attrs.get("rank").as_deref(), Some("0"));
    }

    #[test]
    fn test_immutables_snapshot() {
        let attrs = AttrTable::new();
        attrs.set_immutable("rank", "3").unwrap();
        attrs.set_immutable("size", "8").unwrap();
        attrs.set("log-level", "7").unwrap();
        let snap = attrs.immutables();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("rank").map(String::as_str), Some("3"));
        assert!(!snap.contains_key("log-level"));
    }
}
