//! Registry of the modules described by the loader structures.

use std::collections::HashMap;

use crate::image::Module;

/// Position of a module in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

#[derive(Debug)]
struct Entry {
    module: Module,
    name: String,
    descriptor: u32,
}

/// Modules in registration order, indexed by name.
///
/// Registering a second module under an existing name repoints the name index; the earlier
/// module stays in the ordered sequence with its own descriptor. Nothing is ever removed.
///
/// # Example
///
/// ```rust
/// use ntenv::{image::Module, process::ModuleRegistry};
///
/// let mut registry = ModuleRegistry::new();
/// let id = registry.register("ntdll.dll", Module::new(0x7C90_0000, 0, 0xAF000, "ntdll.dll", "ntdll.dll"), 0x0034_2F00);
///
/// assert_eq!(registry.by_name("ntdll.dll"), Some(id));
/// assert_eq!(registry.descriptor_of(id), Some(0x0034_2F00));
/// ```
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: Vec<Entry>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `module` under `name` with its descriptor address.
    pub fn register(&mut self, name: impl Into<String>, module: Module, descriptor: u32) -> ModuleId {
        let name = name.into();
        let id = ModuleId(self.entries.len());
        self.by_name.insert(name.clone(), id);
        self.entries.push(Entry {
            module,
            name,
            descriptor,
        });
        id
    }

    /// Returns the module most recently registered under `name`.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    /// Returns the metadata of a module.
    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.entries.get(id.0).map(|e| &e.module)
    }

    /// Returns the descriptor address of a module.
    #[must_use]
    pub fn descriptor_of(&self, id: ModuleId) -> Option<u32> {
        self.entries.get(id.0).map(|e| e.descriptor)
    }

    /// Returns the name a module was registered under.
    #[must_use]
    pub fn name_of(&self, id: ModuleId) -> Option<&str> {
        self.entries.get(id.0).map(|e| e.name.as_str())
    }

    /// Iterates over all modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = ModuleId> + '_ {
        (0..self.entries.len()).map(ModuleId)
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
