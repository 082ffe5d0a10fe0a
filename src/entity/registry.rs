//! Lifecycle hooks per entity type.
//!
//! Hooks are registered once at startup and frozen. An entity type with no
//! update hook costs nothing per tick.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::core::id::RuntimeId;

type Hook = Box<dyn Fn(RuntimeId, &mut dyn Any) + Send + Sync>;

fn erase<T, F>(hook: F) -> Hook
where
    T: Any,
    F: Fn(RuntimeId, &mut T) + Send + Sync + 'static,
{
    Box::new(move |runtime_id, value| {
        if let Some(value) = value.downcast_mut::<T>() {
            hook(runtime_id, value);
        }
    })
}

#[derive(Default)]
struct HookTable {
    hooks: HashMap<TypeId, Vec<Hook>>,
}

impl HookTable {
    fn push(&mut self, type_id: TypeId, hook: Hook) {
        self.hooks.entry(type_id).or_default().push(hook);
    }

    fn run(&self, type_id: TypeId, runtime_id: RuntimeId, value: &mut dyn Any) {
        if let Some(hooks) = self.hooks.get(&type_id) {
            for hook in hooks {
                hook(runtime_id, &mut *value);
            }
        }
    }

    fn contains(&self, type_id: TypeId) -> bool {
        self.hooks.contains_key(&type_id)
    }
}

/// Collects hooks during startup.
#[derive(Default)]
pub struct LifecycleBuilder {
    awake: HookTable,
    update: HookTable,
    destroy: HookTable,
}

impl LifecycleBuilder {
    /// Run when an entity of type `T` is created or attached.
    pub fn on_awake<T, F>(&mut self, hook: F) -> &mut Self
    where
        T: Any,
        F: Fn(RuntimeId, &mut T) + Send + Sync + 'static,
    {
        self.awake.push(TypeId::of::<T>(), erase(hook));
        self
    }

    /// Run on every scene tick for live entities of type `T`.
    pub fn on_update<T, F>(&mut self, hook: F) -> &mut Self
    where
        T: Any,
        F: Fn(RuntimeId, &mut T) + Send + Sync + 'static,
    {
        self.update.push(TypeId::of::<T>(), erase(hook));
        self
    }

    /// Run when an entity of type `T` is disposed.
    pub fn on_destroy<T, F>(&mut self, hook: F) -> &mut Self
    where
        T: Any,
        F: Fn(RuntimeId, &mut T) + Send + Sync + 'static,
    {
        self.destroy.push(TypeId::of::<T>(), erase(hook));
        self
    }

    /// Freeze.
    pub fn build(self) -> LifecycleRegistry {
        LifecycleRegistry {
            awake: self.awake,
            update: self.update,
            destroy: self.destroy,
        }
    }
}

/// Frozen hook tables shared by every scene of a process.
#[derive(Default)]
pub struct LifecycleRegistry {
    awake: HookTable,
    update: HookTable,
    destroy: HookTable,
}

impl LifecycleRegistry {
    /// Start a builder.
    pub fn builder() -> LifecycleBuilder {
        LifecycleBuilder::default()
    }

    /// Registry without hooks.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn awake(&self, type_id: TypeId, runtime_id: RuntimeId, value: &mut dyn Any) {
        self.awake.run(type_id, runtime_id, value);
    }

    pub(crate) fn update(&self, type_id: TypeId, runtime_id: RuntimeId, value: &mut dyn Any) {
        self.update.run(type_id, runtime_id, value);
    }

    pub(crate) fn destroy(&self, type_id: TypeId, runtime_id: RuntimeId, value: &mut dyn Any) {
        self.destroy.run(type_id, runtime_id, value);
    }

    /// True if `type_id` has update hooks.
    pub fn has_update(&self, type_id: TypeId) -> bool {
        self.update.contains(type_id)
    }
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("awake_types", &self.awake.hooks.len())
            .field("update_types", &self.update.hooks.len())
            .field("destroy_types", &self.destroy.hooks.len())
            .finish()
    }
}
