//! Protocol registry.
//!
//! Maps a numeric key in a namespace (EtherType, GRE protocol type, ...) to
//! the [`PacketType`](crate::PacketType) interpreting the payload. It is
//! populated by a bootstrap routine and then installed once for the whole
//! process with [`Registry::install`]; interpreters consult the installed
//! registry when deriving the next layer and, in reverse, when finalizing
//! the key field of their header.

use core::any::TypeId;
use std::collections::BTreeMap;
use std::io;
use std::sync::OnceLock;

use crate::interpreter::{type_key, Factory};
use crate::Packet;

/// Name of a key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(&'static str);

impl Namespace {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{namespace}: key {key:#x} already registered with priority {priority}")]
    DuplicateKey {
        namespace: &'static str,
        key: u64,
        priority: i32,
    },
    #[error("{namespace}: type `{name}` already registered under key {key:#x}")]
    DuplicateType {
        namespace: &'static str,
        name: &'static str,
        key: u64,
    },
}

#[derive(Clone, Copy)]
struct Entry {
    priority: i32,
    factory: Factory,
}

#[derive(Clone, Default)]
struct Table {
    /// Entries per key, highest priority first.
    by_key: BTreeMap<u64, Vec<Entry>>,
    by_type: BTreeMap<TypeId, u64>,
}

/// Key to type mapping, one table per [`Namespace`].
#[derive(Clone, Default)]
pub struct Registry {
    tables: BTreeMap<Namespace, Table>,
}

static INSTALLED: OnceLock<Registry> = OnceLock::new();
static EMPTY: Registry = Registry {
    tables: BTreeMap::new(),
};

impl Registry {
    pub const fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Register `factory` for `key` with the default priority 0.
    pub fn register(&mut self, namespace: Namespace, key: u64, factory: Factory) -> Result<(), RegistryError> {
        self.register_with_priority(namespace, key, 0, factory)
    }

    /// Register `factory` for `key`. Several types may share a key as long
    /// as their priorities differ; the highest priority wins. A type can be
    /// registered under one key per namespace only.
    pub fn register_with_priority(
        &mut self,
        namespace: Namespace,
        key: u64,
        priority: i32,
        factory: Factory,
    ) -> Result<(), RegistryError> {
        let table = self.tables.entry(namespace).or_default();
        if let Some(&existing) = table.by_type.get(&type_key(factory)) {
            return Err(RegistryError::DuplicateType {
                namespace: namespace.name(),
                name: factory.name(),
                key: existing,
            });
        }
        let entries = table.by_key.entry(key).or_default();
        if entries.iter().any(|e| e.priority == priority) {
            return Err(RegistryError::DuplicateKey {
                namespace: namespace.name(),
                key,
                priority,
            });
        }
        let at = entries.partition_point(|e| e.priority > priority);
        entries.insert(at, Entry { priority, factory });
        table.by_type.insert(type_key(factory), key);
        pktchain_util::debug!(
            "registry: {} {:#x} -> {} (priority {})",
            namespace.name(),
            key,
            factory.name(),
            priority
        );
        Ok(())
    }

    /// Remove the entry for `key` with `priority`. Returns the type that
    /// was registered.
    pub fn unregister(&mut self, namespace: Namespace, key: u64, priority: i32) -> Option<Factory> {
        let table = self.tables.get_mut(&namespace)?;
        let entries = table.by_key.get_mut(&key)?;
        let at = entries.iter().position(|e| e.priority == priority)?;
        let removed = entries.remove(at);
        if entries.is_empty() {
            table.by_key.remove(&key);
        }
        table.by_type.remove(&type_key(removed.factory));
        Some(removed.factory)
    }

    /// Type registered for `key` with the highest priority.
    pub fn lookup(&self, namespace: Namespace, key: u64) -> Option<Factory> {
        self.tables
            .get(&namespace)?
            .by_key
            .get(&key)?
            .first()
            .map(|e| e.factory)
    }

    /// Key `factory` is registered under.
    pub fn reverse_lookup(&self, namespace: Namespace, factory: Factory) -> Option<u64> {
        self.tables
            .get(&namespace)?
            .by_type
            .get(&type_key(factory))
            .copied()
    }

    /// Key of the type of `packet`.
    pub fn key_of(&self, namespace: Namespace, packet: &Packet) -> Option<u64> {
        self.reverse_lookup(namespace, packet.packet_type().ok()?)
    }

    /// All entries of a namespace as `(key, priority, type name)`, ordered by
    /// key and descending priority.
    pub fn entries(&self, namespace: Namespace) -> impl Iterator<Item = (u64, i32, &'static str)> + '_ {
        self.tables.get(&namespace).into_iter().flat_map(|table| {
            table.by_key.iter().flat_map(|(key, entries)| {
                entries.iter().map(move |e| (*key, e.priority, e.factory.name()))
            })
        })
    }

    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        for (namespace, _) in self.tables.iter() {
            writeln!(w, "{}:", namespace.name())?;
            for (key, priority, name) in self.entries(*namespace) {
                writeln!(w, "  {key:#06x} {priority:>4} {name}")?;
            }
        }
        Ok(())
    }

    /// Make this registry the one consulted by every packet chain. Only the
    /// first installation succeeds, later calls hand the registry back.
    pub fn install(self) -> Result<&'static Registry, Registry> {
        INSTALLED.set(self)?;
        pktchain_util::debug!("registry: installed");
        Ok(INSTALLED.get().unwrap_or(&EMPTY))
    }

    /// The installed registry, or an empty one if none is installed yet.
    pub fn installed() -> &'static Registry {
        INSTALLED.get().unwrap_or(&EMPTY)
    }

    pub fn is_installed() -> bool {
        INSTALLED.get().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interpreter::{DataPacket, PacketType, DATA};
    use crate::parse::Layout;

    const NS: Namespace = Namespace::new("test");

    struct Alpha;
    struct Beta;

    impl PacketType for Alpha {
        fn name(&self) -> &'static str {
            "alpha"
        }

        fn layout(&self) -> &Layout {
            DATA.layout()
        }
    }

    impl PacketType for Beta {
        fn name(&self) -> &'static str {
            "beta"
        }

        fn layout(&self) -> &Layout {
            DATA.layout()
        }
    }

    #[test]
    fn test_lookup() {
        let mut registry = Registry::new();
        registry.register(NS, 0x0800, &Alpha).unwrap();
        registry.register(Namespace::new("other"), 0x0800, &Beta).unwrap();
        assert_eq!(registry.lookup(NS, 0x0800).unwrap().name(), "alpha");
        assert!(registry.lookup(NS, 0x86dd).is_none());
        assert_eq!(registry.reverse_lookup(NS, &Alpha), Some(0x0800));
        assert_eq!(registry.reverse_lookup(NS, &Beta), None);
        assert!(registry.lookup(Namespace::new("missing"), 0x0800).is_none());
    }

    #[test]
    fn test_priority() {
        let mut registry = Registry::new();
        registry.register(NS, 1, &Alpha).unwrap();
        registry.register_with_priority(NS, 1, 10, &Beta).unwrap();
        assert_eq!(registry.lookup(NS, 1).unwrap().name(), "beta");
        let entries: Vec<_> = registry.entries(NS).collect();
        assert_eq!(entries, vec![(1, 10, "beta"), (1, 0, "alpha")]);

        assert_eq!(registry.unregister(NS, 1, 10).unwrap().name(), "beta");
        assert_eq!(registry.lookup(NS, 1).unwrap().name(), "alpha");
        assert!(registry.reverse_lookup(NS, &Beta).is_none());
        assert!(registry.unregister(NS, 1, 10).is_none());
    }

    #[test]
    fn test_duplicates() {
        let mut registry = Registry::new();
        registry.register(NS, 1, &Alpha).unwrap();
        assert_eq!(
            registry.register(NS, 1, &Beta),
            Err(RegistryError::DuplicateKey {
                namespace: "test",
                key: 1,
                priority: 0
            })
        );
        assert!(matches!(
            registry.register(NS, 2, &Alpha),
            Err(RegistryError::DuplicateType { key: 1, .. })
        ));
        registry.register(NS, 2, &DataPacket).unwrap();
    }

    #[test]
    fn test_dump() {
        let mut registry = Registry::new();
        registry.register(NS, 0x6558, &Alpha).unwrap();
        let mut out = Vec::new();
        registry.dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("test:\n"));
        assert!(out.contains("0x6558"));
        assert!(out.contains("alpha"));
    }
}
