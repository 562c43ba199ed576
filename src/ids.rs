//! Collision-free numeric identifiers for externally-defined content.
//!
//! The host's own values occupy a reserved range below the base. Everything an extension
//! defines gets a value above it, assigned once per `(namespace, name)` pair. The
//! assignment map persists between sessions so that saved games keep referring to the
//! same things.

use crate::storage::Store;
use std::collections::HashMap;

pub struct IdAllocator {
    assigned: HashMap<String, u32>,
    next: u32,
}

impl IdAllocator {
    /// A fresh allocator handing out values starting at `base`.
    pub fn new(base: u32) -> IdAllocator {
        IdAllocator {
            assigned: HashMap::new(),
            next: base,
        }
    }

    /// Restores previously-assigned values, continuing above both the base and anything
    /// already handed out.
    pub fn load(store: &Store, base: u32) -> IdAllocator {
        let assigned: HashMap<String, u32> = store.get("ids", "assigned").unwrap_or_default();

        let next = assigned
            .values()
            .copied()
            .max()
            .map(|highest| highest + 1)
            .unwrap_or(base)
            .max(base);

        IdAllocator { assigned, next }
    }

    pub fn save(&self, store: &mut Store) {
        store.set("ids", "assigned", &self.assigned);
    }

    /// The stable value for `(namespace, name)`, allocating one on first sight.
    pub fn value_for(&mut self, namespace: &str, name: &str) -> u32 {
        let key = format!("{namespace}.{name}");

        if let Some(value) = self.assigned.get(&key) {
            return *value;
        }

        let value = self.next;
        self.next += 1;

        log::debug!("assigned {value} to '{key}'");
        self.assigned.insert(key, value);

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn values_are_stable_and_collision_free() {
        let mut ids = IdAllocator::new(100);

        let a = ids.value_for("mod_a", "thing");
        let b = ids.value_for("mod_b", "thing");

        assert_eq!(a, 100);
        assert_eq!(b, 101);
        assert_eq!(ids.value_for("mod_a", "thing"), a);
    }

    #[test]
    fn assignments_survive_a_save_and_load() {
        let path = std::env::temp_dir().join(format!("graft-ids-{}.json", std::process::id()));
        let mut store = Store::open(&path);

        let mut ids = IdAllocator::new(100);
        let value = ids.value_for("mod_a", "thing");
        ids.save(&mut store);
        store.save().unwrap();

        let reopened = Store::open(&path);
        let mut restored = IdAllocator::load(&reopened, 100);

        assert_eq!(restored.value_for("mod_a", "thing"), value);
        assert_eq!(restored.value_for("mod_a", "other"), value + 1);

        let _ = std::fs::remove_file(&path);
    }
}
