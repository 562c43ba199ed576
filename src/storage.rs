//! Key/value persistence for state kept between sessions.
//!
//! Keys are namespaced strings; values are opaque JSON blobs the engine does not
//! interpret. Consumers decide what goes in them.

use eyre::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A namespaced key/value store backed by a single JSON file.
pub struct Store {
    path: PathBuf,
    map: HashMap<String, serde_json::Value>,
    dirty: bool,
}

impl Store {
    /// Opens the store at `path`. A missing or unreadable file is not fatal: the store
    /// starts empty and the next save recreates it.
    pub fn open(path: impl Into<PathBuf>) -> Store {
        let path = path.into();

        let map = match Store::load_path(&path) {
            Ok(map) => map,
            Err(err) => {
                log::error!("Failed to load store from {}: {:?}", path.display(), err);
                log::info!("Starting with an empty store instead.");
                HashMap::new()
            }
        };

        Store {
            path,
            map,
            dirty: false,
        }
    }

    fn load_path(path: &Path) -> Result<HashMap<String, serde_json::Value>> {
        Ok(serde_json::from_reader(std::fs::File::open(path)?)?)
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let value = self.map.get(&scoped(namespace, key))?;

        match serde_json::from_value(value.clone()) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!(
                    "Stored value for '{}' does not deserialize: {}",
                    scoped(namespace, key),
                    err
                );
                None
            }
        }
    }

    pub fn set<T: serde::Serialize>(&mut self, namespace: &str, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.map.insert(scoped(namespace, key), value);
                self.dirty = true;
            }
            Err(err) => {
                log::error!("Value for '{}' does not serialize: {}", scoped(namespace, key), err)
            }
        }
    }

    pub fn remove(&mut self, namespace: &str, key: &str) {
        if self.map.remove(&scoped(namespace, key)).is_some() {
            self.dirty = true;
        }
    }

    /// Writes the store back to disk. Skipped when nothing has changed since the last
    /// save.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            log::info!("Store has not changed since last save.");
            return Ok(());
        }

        self.dirty = false;

        Ok(serde_json::to_writer_pretty(
            std::fs::File::create(&self.path)?,
            &self.map,
        )?)
    }
}

fn scoped(namespace: &str, key: &str) -> String {
    format!("{namespace}.{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_store(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("graft-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn values_round_trip_through_disk() {
        let path = temp_store("roundtrip");

        let mut store = Store::open(&path);
        store.set("combat", "last_damage", &17i64);
        store.set("combat", "phase", &"upkeep".to_string());
        store.save().unwrap();

        let reopened = Store::open(&path);
        assert_eq!(reopened.get::<i64>("combat", "last_damage"), Some(17));
        assert_eq!(
            reopened.get::<String>("combat", "phase"),
            Some("upkeep".to_string())
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn namespaces_keep_keys_apart() {
        let mut store = Store::open(temp_store("namespaces"));

        store.set("a", "key", &1i64);
        store.set("b", "key", &2i64);

        assert_eq!(store.get::<i64>("a", "key"), Some(1));
        assert_eq!(store.get::<i64>("b", "key"), Some(2));
    }

    #[test]
    fn missing_files_open_empty() {
        let store = Store::open(temp_store("does-not-exist"));
        assert_eq!(store.get::<i64>("a", "key"), None);
    }

    #[test]
    fn mismatched_types_read_as_absent() {
        let mut store = Store::open(temp_store("mismatch"));
        store.set("a", "key", &"text".to_string());

        assert_eq!(store.get::<i64>("a", "key"), None);
    }
}
