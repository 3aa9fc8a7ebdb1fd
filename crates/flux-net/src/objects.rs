//! Replicated object state reduced from world actions, authority grants,
//! ECS synchronization and peer lifecycle handling.
//!
//! The action store is the source of truth: spawns, destroys and authority
//! transfers fold into [`NetworkObjectState`], and [`sync_world`] makes the
//! ECS world match it. Entity frames only ever carry component values.

use std::collections::{BTreeMap, HashSet};

use bevy_ecs::prelude::*;
use flux_actions::{
    Action, ActionStore, PeerId, QueueHandle, Receptor, ReceptorError, StateDefinition,
    StateHandle, Uuid,
};
use glam::{DVec3, Quat};

use crate::components::{NetworkId, NetworkObject, NetworkObjectIndex, Transform, Velocity};
use crate::error::NetworkError;
use crate::network::{Network, NetworkHooks, NetworkPeer, UserId};
use crate::serialization::ShadowStore;
use crate::world_actions::WorldAction;

// ---------------------------------------------------------------------------
// Reduced state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Object { prefab: String },
    Avatar { avatar: String },
}

/// One live object as described by the applied actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub entity_uuid: String,
    pub owner_peer: PeerId,
    pub owner_user: UserId,
    pub network_id: NetworkId,
    pub authority_peer: PeerId,
    pub kind: ObjectKind,
    pub position: DVec3,
    pub rotation: Quat,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkObjectState {
    pub objects: BTreeMap<String, ObjectRecord>,
    /// Latest peer list published by the host.
    pub peers: Vec<NetworkPeer>,
}

impl NetworkObjectState {
    pub fn object(&self, entity_uuid: &str) -> Option<&ObjectRecord> {
        self.objects.get(entity_uuid)
    }

    /// Objects whose authority is `peer`.
    pub fn authority_of<'a>(&'a self, peer: &'a PeerId) -> impl Iterator<Item = &'a ObjectRecord> {
        self.objects
            .values()
            .filter(move |record| &record.authority_peer == peer)
    }
}

fn receive_spawn(
    state: &mut NetworkObjectState,
    action: &Action<WorldAction>,
) -> Result<(), ReceptorError> {
    let (entity_uuid, owner_user, network_id, kind, placement) = match action.payload() {
        WorldAction::SpawnObject {
            entity_uuid,
            owner_user,
            network_id,
            prefab,
            placement,
        } => (
            entity_uuid,
            owner_user,
            network_id,
            ObjectKind::Object {
                prefab: prefab.clone(),
            },
            placement,
        ),
        WorldAction::SpawnAvatar {
            entity_uuid,
            owner_user,
            network_id,
            avatar,
            placement,
        } => (
            entity_uuid,
            owner_user,
            network_id,
            ObjectKind::Avatar {
                avatar: avatar.clone(),
            },
            placement,
        ),
        _ => return Ok(()),
    };
    if state.objects.contains_key(entity_uuid) {
        return Err(ReceptorError::Rejected(format!(
            "object {entity_uuid} already exists"
        )));
    }
    let clash = state.objects.values().any(|record| {
        &record.owner_peer == action.peer() && record.network_id == *network_id
    });
    if clash {
        return Err(ReceptorError::Rejected(format!(
            "network id {network_id} of {} already in use",
            action.peer()
        )));
    }
    state.objects.insert(
        entity_uuid.clone(),
        ObjectRecord {
            entity_uuid: entity_uuid.clone(),
            owner_peer: action.peer().clone(),
            owner_user: owner_user.clone(),
            network_id: *network_id,
            authority_peer: action.peer().clone(),
            kind,
            position: placement.position,
            rotation: placement.rotation,
        },
    );
    Ok(())
}

fn receive_destroy(
    state: &mut NetworkObjectState,
    action: &Action<WorldAction>,
) -> Result<(), ReceptorError> {
    if let WorldAction::DestroyObject { entity_uuid } = action.payload() {
        state.objects.remove(entity_uuid);
    }
    Ok(())
}

fn receive_transfer(
    state: &mut NetworkObjectState,
    action: &Action<WorldAction>,
) -> Result<(), ReceptorError> {
    if let WorldAction::TransferAuthority {
        entity_uuid,
        new_authority,
    } = action.payload()
    {
        // Transfers for objects destroyed meanwhile are stale, not errors.
        if let Some(record) = state.objects.get_mut(entity_uuid) {
            record.authority_peer = new_authority.clone();
        }
    }
    Ok(())
}

fn receive_peers(
    state: &mut NetworkObjectState,
    action: &Action<WorldAction>,
) -> Result<(), ReceptorError> {
    if let WorldAction::UpdatePeers { peers } = action.payload() {
        state.peers = peers.clone();
    }
    Ok(())
}

/// State definition folding world actions into [`NetworkObjectState`].
pub fn network_object_state() -> StateDefinition<NetworkObjectState, WorldAction> {
    StateDefinition::new("network_objects", NetworkObjectState::default)
        .receptor(Receptor::new("spawn", "spawnObject", receive_spawn))
        .receptor(Receptor::new("destroy", "destroyObject", receive_destroy))
        .receptor(Receptor::new("transfer", "transferAuthority", receive_transfer))
        .receptor(Receptor::new("peers", "updatePeers", receive_peers))
}

// ---------------------------------------------------------------------------
// Authority grants
// ---------------------------------------------------------------------------

/// Host-side reactor answering `requestAuthority` actions.
#[derive(Debug)]
pub struct AuthorityGrants {
    queue: QueueHandle,
    handled: HashSet<Uuid>,
}

impl AuthorityGrants {
    pub fn new(store: &mut ActionStore<WorldAction>) -> Self {
        Self {
            queue: store.create_queue("requestAuthority"),
            handled: HashSet::new(),
        }
    }

    /// Grants pending requests. Only the host grants; a request is honored
    /// if the requester sent it itself, is connected, and the object exists.
    /// Returns the number of transfers dispatched.
    pub fn process(
        &mut self,
        store: &mut ActionStore<WorldAction>,
        objects: StateHandle<NetworkObjectState>,
        network: &Network,
    ) -> Result<usize, NetworkError> {
        let local = store.peer_id().clone();
        let batch = store.next_actions(self.queue)?;
        let requests: Vec<(Uuid, PeerId, String, PeerId)> = batch
            .actions
            .iter()
            .filter(|action| !self.handled.contains(&action.uuid()))
            .filter_map(|action| match action.payload() {
                WorldAction::RequestAuthority {
                    entity_uuid,
                    requester,
                } => Some((
                    action.uuid(),
                    action.peer().clone(),
                    entity_uuid.clone(),
                    requester.clone(),
                )),
                _ => None,
            })
            .collect();

        if !network.is_hosting(&local) {
            return Ok(0);
        }

        let mut granted = 0;
        for (uuid, author, entity_uuid, requester) in requests {
            self.handled.insert(uuid);
            if author != requester {
                tracing::warn!(%author, %requester, entity = %entity_uuid, "authority request on behalf of another peer ignored");
                continue;
            }
            if !network.contains_peer(&requester) {
                tracing::debug!(%requester, entity = %entity_uuid, "authority request from departed peer ignored");
                continue;
            }
            let current = store
                .state(objects)
                .and_then(|state| state.object(&entity_uuid))
                .map(|record| record.authority_peer.clone());
            match current {
                Some(current) if current == requester => {}
                Some(_) => {
                    store.dispatch(WorldAction::TransferAuthority {
                        entity_uuid: entity_uuid.clone(),
                        new_authority: requester.clone(),
                    })?;
                    tracing::info!(entity = %entity_uuid, to = %requester, "authority granted");
                    granted += 1;
                }
                None => {
                    tracing::debug!(entity = %entity_uuid, "authority request for unknown object");
                }
            }
        }
        Ok(granted)
    }
}

// ---------------------------------------------------------------------------
// World sync
// ---------------------------------------------------------------------------

/// Changes made by one [`sync_world`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub spawned: usize,
    pub despawned: usize,
    pub authority_changed: usize,
}

/// Makes the ECS world match the reduced object state.
///
/// Spawns entities for new records, despawns entities whose record is gone
/// (clearing their shadows), and updates authority. Component values are
/// only set at spawn; afterwards they come from entity frames.
pub fn sync_world(
    world: &mut World,
    index: &mut NetworkObjectIndex,
    state: &NetworkObjectState,
    shadows: &mut ShadowStore,
) -> SyncReport {
    let mut report = SyncReport::default();

    let stale: Vec<String> = index
        .uuids()
        .filter(|uuid| !state.objects.contains_key(*uuid))
        .map(str::to_owned)
        .collect();
    for uuid in stale {
        if let Some(entity) = index.remove(&uuid) {
            shadows.clear_entity(entity);
            if world.get_entity(entity).is_ok() {
                world.despawn(entity);
            }
            tracing::debug!(entity = %uuid, "network object despawned");
            report.despawned += 1;
        }
    }

    for record in state.objects.values() {
        match index.entity_by_uuid(&record.entity_uuid) {
            Some(entity) => {
                if let Some(mut object) = world.get_mut::<NetworkObject>(entity)
                    && object.authority_peer != record.authority_peer
                {
                    tracing::debug!(
                        entity = %record.entity_uuid,
                        from = %object.authority_peer,
                        to = %record.authority_peer,
                        "authority changed"
                    );
                    object.authority_peer = record.authority_peer.clone();
                    report.authority_changed += 1;
                }
            }
            None => {
                let entity = world
                    .spawn((
                        NetworkObject {
                            entity_uuid: record.entity_uuid.clone(),
                            owner_peer: record.owner_peer.clone(),
                            owner_user: record.owner_user.clone(),
                            network_id: record.network_id,
                            authority_peer: record.authority_peer.clone(),
                        },
                        Transform {
                            position: record.position,
                            rotation: record.rotation,
                        },
                        Velocity::default(),
                    ))
                    .id();
                index.insert(
                    &record.entity_uuid,
                    record.owner_peer.clone(),
                    record.network_id,
                    entity,
                );
                tracing::debug!(entity = %record.entity_uuid, owner = %record.owner_peer, "network object spawned");
                report.spawned += 1;
            }
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Peer lifecycle
// ---------------------------------------------------------------------------

/// Registers a joining peer. The host publishes the new peer list.
pub fn handle_peer_joined(
    network: &mut Network,
    store: &mut ActionStore<WorldAction>,
    hooks: &mut dyn NetworkHooks,
    peer_id: PeerId,
    user_id: UserId,
) -> Result<NetworkPeer, NetworkError> {
    let peer = network.add_peer(peer_id, user_id).clone();
    if network.is_hosting(store.peer_id()) {
        publish_peers(network, store)?;
    }
    hooks.on_peer_joined(network, &peer);
    Ok(peer)
}

/// Handles a departed peer: drops it from the registry and forgets its
/// cached actions. On the host, objects the peer owned are destroyed, since
/// their cached spawns are gone and their frames can no longer be addressed.
/// Objects it only held authority over move back to the host.
pub fn handle_peer_left(
    network: &mut Network,
    store: &mut ActionStore<WorldAction>,
    objects: StateHandle<NetworkObjectState>,
    hooks: &mut dyn NetworkHooks,
    peer_id: &PeerId,
) -> Result<Option<NetworkPeer>, NetworkError> {
    let Some(peer) = network.remove_peer(peer_id) else {
        return Ok(None);
    };
    store.remove_cached_for_peer(peer_id);

    let local = store.peer_id().clone();
    if network.is_hosting(&local) {
        let (owned, held): (Vec<ObjectRecord>, Vec<ObjectRecord>) = store
            .state(objects)
            .map(|state| {
                state
                    .objects
                    .values()
                    .filter(|record| {
                        &record.owner_peer == peer_id || &record.authority_peer == peer_id
                    })
                    .cloned()
                    .partition(|record| &record.owner_peer == peer_id)
            })
            .unwrap_or_default();
        for record in owned {
            tracing::info!(entity = %record.entity_uuid, owner = %peer_id, "destroying object of departed peer");
            store.dispatch(WorldAction::DestroyObject {
                entity_uuid: record.entity_uuid,
            })?;
        }
        for record in held {
            tracing::info!(entity = %record.entity_uuid, from = %peer_id, to = %local, "authority re-homed to host");
            store.dispatch(WorldAction::TransferAuthority {
                entity_uuid: record.entity_uuid,
                new_authority: local.clone(),
            })?;
        }
        publish_peers(network, store)?;
    }
    hooks.on_peer_left(network, &peer);
    Ok(Some(peer))
}

fn publish_peers(network: &Network, store: &mut ActionStore<WorldAction>) -> Result<(), NetworkError> {
    store.dispatch(WorldAction::UpdatePeers {
        peers: network.peers().cloned().collect(),
    })?;
    Ok(())
}

/// Brings a non-host registry in line with the host's published peer list.
/// Returns `true` if anything changed.
pub fn apply_peer_snapshot(network: &mut Network, state: &NetworkObjectState) -> bool {
    if state.peers.is_empty() {
        return false;
    }
    let listed: HashSet<&PeerId> = state.peers.iter().map(|peer| &peer.peer_id).collect();
    let departed: Vec<PeerId> = network
        .peers()
        .filter(|peer| !listed.contains(&peer.peer_id))
        .map(|peer| peer.peer_id.clone())
        .collect();

    let mut changed = !departed.is_empty();
    for peer_id in departed {
        network.remove_peer(&peer_id);
    }
    for peer in &state.peers {
        if network.peer(&peer.peer_id) != Some(peer) {
            network.add_peer_with_indices(peer.clone());
            changed = true;
        }
    }
    changed
}
