//! Catalog and lifecycle for extension slots: handler objects attached to host-owned
//! things, hooked into trigger capabilities for as long as their owner is alive.

use crate::ids::IdAllocator;
use crate::storage::Store;
use crate::triggers::{Bus, CapabilityTag, Handler};
use std::sync::Arc;

/// Stable identity of an extension kind, allocated through [`IdAllocator`] so values
/// never collide with the host's own or with other extensions'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionId(pub u32);

/// Creates the handler object for a new instance of a kind.
pub type Spawn = Box<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// A catalog entry: everything needed to bring an instance of this extension to life.
pub struct ExtensionKind {
    pub id: ExtensionId,
    pub name: String,

    /// Whether several live instances of this kind may coexist.
    pub stackable: bool,
    pub capabilities: Vec<CapabilityTag>,
    pub spawn: Spawn,
}

/// A live instance. The manager owns the handler; the bus only ever holds weak
/// references to it.
struct Instance {
    kind: ExtensionId,

    /// Ordinal among currently-live instances of the same kind, starting at 1.
    number: u32,
    handler: Arc<dyn Handler>,
}

/// The set of defined extension kinds and their currently-live instances.
#[derive(Default)]
pub struct Extensions {
    kinds: Vec<ExtensionKind>,
    live: Vec<Instance>,
}

impl Extensions {
    pub fn new() -> Extensions {
        Extensions::default()
    }

    /// Adds a kind to the catalog, allocating (or re-using) its identity from the
    /// `(namespace, name)` pair. Defining the same pair twice returns the existing id.
    pub fn define(
        &mut self,
        ids: &mut IdAllocator,
        namespace: &str,
        name: &str,
        stackable: bool,
        capabilities: Vec<CapabilityTag>,
        spawn: Spawn,
    ) -> ExtensionId {
        let id = ExtensionId(ids.value_for(namespace, name));

        if self.kinds.iter().any(|kind| kind.id == id) {
            log::warn!("extension kind '{namespace}.{name}' defined twice");
            return id;
        }

        self.kinds.push(ExtensionKind {
            id,
            name: name.to_string(),
            stackable,
            capabilities,
            spawn,
        });

        id
    }

    pub fn id_of(&self, name: &str) -> Option<ExtensionId> {
        self.kinds
            .iter()
            .find(|kind| kind.name == name)
            .map(|kind| kind.id)
    }

    pub fn live_count(&self, id: ExtensionId) -> usize {
        self.live.iter().filter(|inst| inst.kind == id).count()
    }

    /// Brings a new instance of `id` to life and registers its handler with the bus for
    /// every capability the kind declares. Returns the instance number.
    ///
    /// Requesting a second instance of a non-stackable kind while one is live is not an
    /// error: no instance is created and `None` is returned. That is the defined policy.
    pub fn activate(&mut self, id: ExtensionId, bus: &Bus) -> Option<u32> {
        let live = self.live_count(id);

        let kind = match self.kinds.iter().find(|kind| kind.id == id) {
            Some(kind) => kind,
            None => {
                log::warn!("activation requested for unknown extension id {id:?}");
                return None;
            }
        };

        if !kind.stackable && live > 0 {
            log::debug!("'{}' is not stackable; keeping the existing instance", kind.name);
            return None;
        }

        let handler = (kind.spawn)();

        for tag in &kind.capabilities {
            bus.register(*tag, &handler);
        }

        let number = live as u32 + 1;
        log::info!("activated '{}' instance {}", kind.name, number);

        self.live.push(Instance {
            kind: id,
            number,
            handler,
        });

        Some(number)
    }

    /// Destroys every live instance of `id`: the bus drops its references before the
    /// owning handles go away, so it can never call into a destroyed handler.
    pub fn deactivate_all(&mut self, id: ExtensionId, bus: &Bus) {
        self.live.retain(|inst| {
            if inst.kind != id {
                return true;
            }

            bus.unregister(&inst.handler);
            false
        });
    }

    /// Destroys every live instance of every kind, e.g. when the host tears a run down.
    pub fn deactivate_everything(&mut self, bus: &Bus) {
        for inst in self.live.drain(..) {
            bus.unregister(&inst.handler);
        }
    }

    /// Instance numbers currently live for `id`, in activation order.
    pub fn instance_numbers(&self, id: ExtensionId) -> Vec<u32> {
        self.live
            .iter()
            .filter(|inst| inst.kind == id)
            .map(|inst| inst.number)
            .collect()
    }

    /// Persists which kinds are live and how many instances each has.
    pub fn save_active(&self, store: &mut Store) {
        let active: Vec<(String, u32)> = self
            .kinds
            .iter()
            .map(|kind| (kind.name.clone(), self.live_count(kind.id) as u32))
            .filter(|(_, count)| *count > 0)
            .collect();

        store.set("extensions", "active", &active);
    }

    /// Re-activates the instances recorded by an earlier `save_active`. Kinds that no
    /// longer exist are skipped with a warning; stacking rules still apply.
    pub fn restore_active(&mut self, store: &Store, bus: &Bus) {
        let active: Vec<(String, u32)> = store.get("extensions", "active").unwrap_or_default();

        for (name, count) in active {
            match self.id_of(&name) {
                Some(id) => {
                    for _ in 0..count {
                        self.activate(id, bus);
                    }
                }
                None => log::warn!("saved state references unknown extension '{name}'"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::{CapabilityTag, Context};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const UPKEEP: CapabilityTag = CapabilityTag("test.upkeep");

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    impl Handler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn responds_to(&self, _tag: CapabilityTag, _ctx: &Context) -> bool {
            true
        }

        fn fire(&self, _tag: CapabilityTag, _ctx: &Context) -> eyre::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fixture(stackable: bool) -> (Extensions, ExtensionId, Arc<AtomicUsize>) {
        let mut ids = IdAllocator::new(1000);
        let mut extensions = Extensions::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let spawn_hits = hits.clone();
        let id = extensions.define(
            &mut ids,
            "tests",
            "counting",
            stackable,
            vec![UPKEEP],
            Box::new(move || {
                Arc::new(Counting {
                    hits: spawn_hits.clone(),
                })
            }),
        );

        (extensions, id, hits)
    }

    #[test]
    fn non_stackable_kinds_refuse_a_second_instance() {
        let bus = Bus::new();
        let (mut extensions, id, _hits) = fixture(false);

        assert_eq!(extensions.activate(id, &bus), Some(1));
        assert_eq!(extensions.activate(id, &bus), None);
        assert_eq!(extensions.live_count(id), 1);
    }

    #[test]
    fn stackable_kinds_count_their_instances() {
        let bus = Bus::new();
        let (mut extensions, id, hits) = fixture(true);

        assert_eq!(extensions.activate(id, &bus), Some(1));
        assert_eq!(extensions.activate(id, &bus), Some(2));
        assert_eq!(extensions.instance_numbers(id), vec![1, 2]);

        bus.broadcast(UPKEEP, &Context::empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deactivation_reaches_the_bus_before_the_handler_dies() {
        let bus = Bus::new();
        let (mut extensions, id, hits) = fixture(true);

        extensions.activate(id, &bus);
        extensions.deactivate_all(id, &bus);

        bus.broadcast(UPKEEP, &Context::empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(extensions.live_count(id), 0);
    }

    #[test]
    fn active_instances_survive_a_save_and_restore() {
        let bus = Bus::new();
        let (mut extensions, id, _hits) = fixture(true);

        extensions.activate(id, &bus);
        extensions.activate(id, &bus);

        let mut store = Store::open(
            std::env::temp_dir().join(format!("graft-ext-{}.json", std::process::id())),
        );
        extensions.save_active(&mut store);

        let (mut fresh, fresh_id, _fresh_hits) = fixture(true);
        fresh.restore_active(&store, &bus);

        assert_eq!(fresh.live_count(fresh_id), 2);
    }
}
