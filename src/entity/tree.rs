//! Entity tree.
//!
//! Every entity of a scene lives in one arena keyed by [`RuntimeId`].
//! Components are entities too: they hang off their owner, one per type,
//! and are disposed with it.
//!
//! ```text
//!   scene
//!    ├── player (Player)
//!    │    ├── [component] Inventory
//!    │    └── pet (Pet)
//!    └── session (Session)
//!         └── [component] AddressableRoute
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::registry::LifecycleRegistry;
use crate::core::id::{EntityId, IdError, IdFactory, RuntimeId};

/// Entity errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    /// No entity at this address.
    #[error("Entity {0} not found")]
    NotFound(RuntimeId),

    /// An entity already uses this address.
    #[error("Entity {0} already exists")]
    AlreadyExists(RuntimeId),

    /// The entity already has a component of this type.
    #[error("Entity {entity} already has a {component} component")]
    DuplicateComponent {
        /// Owner.
        entity: RuntimeId,
        /// Component type name.
        component: &'static str,
    },

    /// The entity has no component of this type.
    #[error("Entity {entity} has no {component} component")]
    ComponentNotFound {
        /// Owner.
        entity: RuntimeId,
        /// Component type name.
        component: &'static str,
    },

    /// No id could be allocated.
    #[error(transparent)]
    Id(#[from] IdError),
}

struct Node {
    id: EntityId,
    parent: Option<RuntimeId>,
    children: Vec<RuntimeId>,
    components: HashMap<TypeId, RuntimeId>,
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any>,
}

/// Arena of a scene's entities.
pub struct EntityTree {
    nodes: HashMap<RuntimeId, Node>,
    ids: Arc<IdFactory>,
    lifecycle: Arc<LifecycleRegistry>,
}

impl EntityTree {
    /// Empty tree allocating ids from `ids`.
    pub fn new(ids: Arc<IdFactory>, lifecycle: Arc<LifecycleRegistry>) -> Self {
        Self {
            nodes: HashMap::new(),
            ids,
            lifecycle,
        }
    }

    fn insert<T: Any>(
        &mut self,
        runtime_id: RuntimeId,
        id: EntityId,
        parent: Option<RuntimeId>,
        value: T,
    ) -> Result<RuntimeId, EntityError> {
        if self.nodes.contains_key(&runtime_id) {
            return Err(EntityError::AlreadyExists(runtime_id));
        }
        let mut node = Node {
            id,
            parent,
            children: Vec::new(),
            components: HashMap::new(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            value: Box::new(value),
        };
        self.lifecycle.awake(node.type_id, runtime_id, node.value.as_mut());
        self.nodes.insert(runtime_id, node);
        Ok(runtime_id)
    }

    /// Create a root entity. `id` is the persistent id when the entity was
    /// loaded from storage; a new one is allocated otherwise.
    pub fn create_entity<T: Any>(&mut self, value: T, id: Option<EntityId>) -> Result<RuntimeId, EntityError> {
        let runtime_id = self.ids.next_runtime_id()?;
        let id = match id {
            Some(id) => id,
            None => self.ids.next_entity_id()?,
        };
        self.insert(runtime_id, id, None, value)
    }

    /// Create a root entity at a given address.
    pub fn create_entity_at<T: Any>(&mut self, runtime_id: RuntimeId, value: T) -> Result<RuntimeId, EntityError> {
        let id = self.ids.next_entity_id()?;
        self.insert(runtime_id, id, None, value)
    }

    /// Create a child of `parent`.
    pub fn create_child<T: Any>(&mut self, parent: RuntimeId, value: T) -> Result<RuntimeId, EntityError> {
        if !self.nodes.contains_key(&parent) {
            return Err(EntityError::NotFound(parent));
        }
        let runtime_id = self.ids.next_runtime_id()?;
        let id = self.ids.next_entity_id()?;
        self.insert(runtime_id, id, Some(parent), value)?;
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(runtime_id);
        }
        Ok(runtime_id)
    }

    /// Attach a component. A second component of the same type is rejected.
    pub fn add_component<T: Any>(&mut self, entity: RuntimeId, value: T) -> Result<RuntimeId, EntityError> {
        let type_id = TypeId::of::<T>();
        let owner = self.nodes.get(&entity).ok_or(EntityError::NotFound(entity))?;
        if owner.components.contains_key(&type_id) {
            return Err(EntityError::DuplicateComponent {
                entity,
                component: type_name::<T>(),
            });
        }
        let id = owner.id;

        let runtime_id = self.ids.next_runtime_id()?;
        self.insert(runtime_id, id, Some(entity), value)?;
        if let Some(owner) = self.nodes.get_mut(&entity) {
            owner.components.insert(type_id, runtime_id);
        }
        Ok(runtime_id)
    }

    /// Detach and dispose a component.
    pub fn remove_component<T: Any>(&mut self, entity: RuntimeId) -> Result<(), EntityError> {
        let component = self.component_id::<T>(entity).ok_or(EntityError::ComponentNotFound {
            entity,
            component: type_name::<T>(),
        })?;
        self.dispose(component)?;
        Ok(())
    }

    fn component_id<T: Any>(&self, entity: RuntimeId) -> Option<RuntimeId> {
        self.nodes.get(&entity)?.components.get(&TypeId::of::<T>()).copied()
    }

    /// Entity value.
    pub fn get<T: Any>(&self, runtime_id: RuntimeId) -> Option<&T> {
        self.nodes.get(&runtime_id)?.value.downcast_ref()
    }

    /// Mutable entity value.
    pub fn get_mut<T: Any>(&mut self, runtime_id: RuntimeId) -> Option<&mut T> {
        self.nodes.get_mut(&runtime_id)?.value.downcast_mut()
    }

    /// Component of `entity`.
    pub fn get_component<T: Any>(&self, entity: RuntimeId) -> Option<&T> {
        self.get(self.component_id::<T>(entity)?)
    }

    /// Mutable component of `entity`.
    pub fn get_component_mut<T: Any>(&mut self, entity: RuntimeId) -> Option<&mut T> {
        let component = self.component_id::<T>(entity)?;
        self.get_mut(component)
    }

    /// True if `entity` has a `T` component.
    pub fn has_component<T: Any>(&self, entity: RuntimeId) -> bool {
        self.component_id::<T>(entity).is_some()
    }

    /// Entities whose value is a `T`.
    pub fn iter_of<T: Any>(&self) -> impl Iterator<Item = (RuntimeId, &T)> {
        self.nodes
            .iter()
            .filter_map(|(runtime_id, node)| node.value.downcast_ref::<T>().map(|value| (*runtime_id, value)))
    }

    /// Persistent id of an entity.
    pub fn entity_id(&self, runtime_id: RuntimeId) -> Option<EntityId> {
        self.nodes.get(&runtime_id).map(|node| node.id)
    }

    /// Parent of an entity or component.
    pub fn parent(&self, runtime_id: RuntimeId) -> Option<RuntimeId> {
        self.nodes.get(&runtime_id)?.parent
    }

    /// Children (not components) of an entity.
    pub fn children(&self, runtime_id: RuntimeId) -> &[RuntimeId] {
        self.nodes.get(&runtime_id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    /// Type name of an entity, for logs.
    pub fn type_name_of(&self, runtime_id: RuntimeId) -> Option<&'static str> {
        self.nodes.get(&runtime_id).map(|node| node.type_name)
    }

    /// True if the address is live.
    pub fn contains(&self, runtime_id: RuntimeId) -> bool {
        self.nodes.contains_key(&runtime_id)
    }

    /// Live entity count, components included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dispose an entity with its components and children, deepest first.
    /// Returns the number of entities removed.
    pub fn dispose(&mut self, runtime_id: RuntimeId) -> Result<usize, EntityError> {
        let node = self.nodes.get(&runtime_id).ok_or(EntityError::NotFound(runtime_id))?;
        let parent = node.parent;

        let mut order = Vec::new();
        self.collect_post_order(runtime_id, &mut order);
        for id in &order {
            if let Some(mut node) = self.nodes.remove(id) {
                self.lifecycle.destroy(node.type_id, *id, node.value.as_mut());
            }
        }

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|child| *child != runtime_id);
            parent.components.retain(|_, component| *component != runtime_id);
        }
        debug!("Disposed {} entities under {}", order.len(), runtime_id);
        Ok(order.len())
    }

    fn collect_post_order(&self, runtime_id: RuntimeId, out: &mut Vec<RuntimeId>) {
        if let Some(node) = self.nodes.get(&runtime_id) {
            for component in node.components.values() {
                self.collect_post_order(*component, out);
            }
            for child in &node.children {
                self.collect_post_order(*child, out);
            }
            out.push(runtime_id);
        }
    }

    /// Run update hooks for every live entity that has one.
    pub fn update(&mut self) {
        let lifecycle = &self.lifecycle;
        for (runtime_id, node) in self.nodes.iter_mut() {
            if lifecycle.has_update(node.type_id) {
                lifecycle.update(node.type_id, *runtime_id, node.value.as_mut());
            }
        }
    }

    /// Dispose every root entity.
    pub fn clear(&mut self) -> usize {
        let roots: Vec<RuntimeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        roots.into_iter().filter_map(|root| self.dispose(root).ok()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, PartialEq)]
    struct Player {
        hp: u32,
    }

    #[derive(Debug, PartialEq)]
    struct Inventory {
        slots: usize,
    }

    fn tree_with(lifecycle: LifecycleRegistry) -> EntityTree {
        EntityTree::new(Arc::new(IdFactory::new(7, 1)), Arc::new(lifecycle))
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let mut tree = tree_with(LifecycleRegistry::empty());
        let player = tree.create_entity(Player { hp: 10 }, None).unwrap();
        tree.add_component(player, Inventory { slots: 4 }).unwrap();

        let err = tree.add_component(player, Inventory { slots: 8 }).unwrap_err();
        assert!(matches!(err, EntityError::DuplicateComponent { entity, .. } if entity == player));
        assert_eq!(tree.get_component::<Inventory>(player).unwrap().slots, 4);
    }

    #[test]
    fn test_component_access_and_removal() {
        let mut tree = tree_with(LifecycleRegistry::empty());
        let player = tree.create_entity(Player { hp: 10 }, None).unwrap();
        let component = tree.add_component(player, Inventory { slots: 4 }).unwrap();
        assert_eq!(tree.parent(component), Some(player));
        assert_eq!(tree.entity_id(component), tree.entity_id(player));

        tree.get_component_mut::<Inventory>(player).unwrap().slots = 6;
        assert_eq!(tree.get::<Inventory>(component).unwrap().slots, 6);

        tree.remove_component::<Inventory>(player).unwrap();
        assert!(!tree.has_component::<Inventory>(player));
        assert!(!tree.contains(component));
        assert!(tree.remove_component::<Inventory>(player).is_err());
    }

    #[test]
    fn test_dispose_children_first() {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let mut builder = LifecycleRegistry::builder();
        {
            let log = destroyed.clone();
            builder.on_destroy::<Player, _>(move |id, _| log.lock().push(("player", id)));
        }
        {
            let log = destroyed.clone();
            builder.on_destroy::<Inventory, _>(move |id, _| log.lock().push(("inventory", id)));
        }
        let mut tree = tree_with(builder.build());

        let root = tree.create_entity(Player { hp: 1 }, None).unwrap();
        let child = tree.create_child(root, Player { hp: 2 }).unwrap();
        let component = tree.add_component(child, Inventory { slots: 1 }).unwrap();

        assert_eq!(tree.dispose(root).unwrap(), 3);
        assert!(tree.is_empty());
        assert_eq!(
            destroyed.lock().as_slice(),
            &[("inventory", component), ("player", child), ("player", root)]
        );
    }

    #[test]
    fn test_awake_and_update_hooks() {
        let mut builder = LifecycleRegistry::builder();
        builder.on_awake::<Player, _>(|_, player| player.hp = 100);
        builder.on_update::<Player, _>(|_, player| player.hp -= 1);
        let mut tree = tree_with(builder.build());

        let player = tree.create_entity(Player { hp: 0 }, None).unwrap();
        tree.create_entity(Inventory { slots: 0 }, None).unwrap();
        assert_eq!(tree.get::<Player>(player).unwrap().hp, 100);

        tree.update();
        tree.update();
        assert_eq!(tree.get::<Player>(player).unwrap().hp, 98);
    }

    #[test]
    fn test_fixed_address_and_lookup() {
        let mut tree = tree_with(LifecycleRegistry::empty());
        let address = RuntimeId(12345);
        tree.create_entity_at(address, Player { hp: 3 }).unwrap();
        assert_eq!(tree.create_entity_at(address, Player { hp: 4 }), Err(EntityError::AlreadyExists(address)));
        assert_eq!(tree.iter_of::<Player>().count(), 1);
        assert_eq!(tree.clear(), 1);
    }
}
