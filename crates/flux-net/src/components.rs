//! ECS components of replicated objects and the (owner, network id) index.

use std::collections::{BTreeMap, HashMap};

use bevy_ecs::prelude::*;
use flux_actions::PeerId;
use glam::{DVec3, Quat, Vec3};

use crate::network::UserId;

/// Per-owner-peer monotonic id of a replicated object on the wire.
pub type NetworkId = u32;

/// Marks an entity as replicated.
///
/// Ownership is per user and fixed at spawn; authority is per peer and moves
/// with `transferAuthority` actions. Only the authority peer writes the
/// entity's state to the wire.
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct NetworkObject {
    pub entity_uuid: String,
    pub owner_peer: PeerId,
    pub owner_user: UserId,
    pub network_id: NetworkId,
    pub authority_peer: PeerId,
}

#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: DVec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

#[derive(Component, Debug, Clone, Copy, Default, PartialEq)]
pub struct Velocity {
    pub linear: Vec3,
}

// ---------------------------------------------------------------------------
// NetworkObjectIndex
// ---------------------------------------------------------------------------

/// Resolves wire keys and entity uuids to local entities.
#[derive(Debug, Default)]
pub struct NetworkObjectIndex {
    by_key: BTreeMap<(PeerId, NetworkId), Entity>,
    by_uuid: HashMap<String, (PeerId, NetworkId)>,
    next_ids: HashMap<PeerId, NetworkId>,
}

impl NetworkObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next network id for objects owned by `owner`.
    pub fn allocate_network_id(&mut self, owner: &PeerId) -> NetworkId {
        let next = self.next_ids.entry(owner.clone()).or_insert(0);
        let id = *next;
        *next += 1;
        id
    }

    pub fn insert(&mut self, entity_uuid: &str, owner: PeerId, network_id: NetworkId, entity: Entity) {
        let next = self.next_ids.entry(owner.clone()).or_insert(0);
        *next = (*next).max(network_id.saturating_add(1));
        self.by_uuid
            .insert(entity_uuid.to_owned(), (owner.clone(), network_id));
        self.by_key.insert((owner, network_id), entity);
    }

    pub fn remove(&mut self, entity_uuid: &str) -> Option<Entity> {
        let key = self.by_uuid.remove(entity_uuid)?;
        self.by_key.remove(&key)
    }

    pub fn entity(&self, owner: &PeerId, network_id: NetworkId) -> Option<Entity> {
        self.by_key.get(&(owner.clone(), network_id)).copied()
    }

    pub fn entity_by_uuid(&self, entity_uuid: &str) -> Option<Entity> {
        let key = self.by_uuid.get(entity_uuid)?;
        self.by_key.get(key).copied()
    }

    pub fn contains_uuid(&self, entity_uuid: &str) -> bool {
        self.by_uuid.contains_key(entity_uuid)
    }

    /// Uuids of every indexed object.
    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.by_uuid.keys().map(String::as_str)
    }

    /// Entities in (owner, network id) order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.by_key.values().copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_ids_are_per_owner() {
        let mut index = NetworkObjectIndex::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        assert_eq!(index.allocate_network_id(&a), 0);
        assert_eq!(index.allocate_network_id(&a), 1);
        assert_eq!(index.allocate_network_id(&b), 0);
    }

    #[test]
    fn test_insert_resolve_remove() {
        let mut world = World::new();
        let entity = world.spawn_empty().id();
        let mut index = NetworkObjectIndex::new();
        let owner = PeerId::new("p1");

        index.insert("e1", owner.clone(), 4, entity);
        assert_eq!(index.entity(&owner, 4), Some(entity));
        assert_eq!(index.entity_by_uuid("e1"), Some(entity));
        assert_eq!(index.entity(&PeerId::new("p2"), 4), None);
        // Ids seen from the owner are never allocated again.
        assert_eq!(index.allocate_network_id(&owner), 5);

        assert_eq!(index.remove("e1"), Some(entity));
        assert!(index.is_empty());
        assert!(!index.contains_uuid("e1"));
    }
}
