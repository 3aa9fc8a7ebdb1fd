//! Built-in actions of the `world` topic: object lifecycle, authority and
//! peer list snapshots.

use flux_actions::{
    ActionPayload, CacheOptions, CachePolicy, PeerId, RemovePrevious, Topic, ValidationError,
};
use glam::{DVec3, Quat};
use serde::{Deserialize, Serialize};

use crate::components::NetworkId;
use crate::network::{NetworkPeer, UserId};

/// Cache group shared by spawns and destroys, so a destroy can purge the
/// entity's cached spawn.
pub const OBJECT_CACHE_GROUP: &str = "object";

/// Initial placement of a spawned object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: DVec3,
    pub rotation: Quat,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldAction {
    /// Creates a replicated object owned by the dispatching peer.
    SpawnObject {
        entity_uuid: String,
        owner_user: UserId,
        network_id: NetworkId,
        prefab: String,
        placement: Placement,
    },
    /// A user's avatar. Also a `spawnObject`.
    SpawnAvatar {
        entity_uuid: String,
        owner_user: UserId,
        network_id: NetworkId,
        avatar: String,
        placement: Placement,
    },
    /// Removes an object and its cached spawn.
    DestroyObject { entity_uuid: String },
    /// Asks the host to move authority of an object to `requester`.
    RequestAuthority { entity_uuid: String, requester: PeerId },
    /// Moves authority of an object. Only the host may author it.
    TransferAuthority {
        entity_uuid: String,
        new_authority: PeerId,
    },
    /// Full peer list, replacing the previous snapshot.
    UpdatePeers { peers: Vec<NetworkPeer> },
}

impl WorldAction {
    pub fn entity_uuid(&self) -> Option<&str> {
        match self {
            Self::SpawnObject { entity_uuid, .. }
            | Self::SpawnAvatar { entity_uuid, .. }
            | Self::DestroyObject { entity_uuid }
            | Self::RequestAuthority { entity_uuid, .. }
            | Self::TransferAuthority { entity_uuid, .. } => Some(entity_uuid),
            Self::UpdatePeers { .. } => None,
        }
    }
}

fn require_uuid(entity_uuid: &str) -> Result<(), ValidationError> {
    if entity_uuid.is_empty() {
        return Err(ValidationError::new("entity_uuid", "must not be empty"));
    }
    Ok(())
}

fn require_placement(placement: &Placement) -> Result<(), ValidationError> {
    if !placement.position.is_finite() {
        return Err(ValidationError::new("placement", "position must be finite"));
    }
    if !placement.rotation.is_finite() || placement.rotation.length_squared() < f32::EPSILON {
        return Err(ValidationError::new("placement", "rotation must be a non-zero quaternion"));
    }
    Ok(())
}

impl ActionPayload for WorldAction {
    fn types(&self) -> &'static [&'static str] {
        match self {
            Self::SpawnObject { .. } => &["spawnObject"],
            Self::SpawnAvatar { .. } => &["spawnAvatar", "spawnObject"],
            Self::DestroyObject { .. } => &["destroyObject"],
            Self::RequestAuthority { .. } => &["requestAuthority"],
            Self::TransferAuthority { .. } => &["transferAuthority"],
            Self::UpdatePeers { .. } => &["updatePeers"],
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::SpawnObject {
                entity_uuid,
                prefab,
                placement,
                ..
            } => {
                require_uuid(entity_uuid)?;
                if prefab.is_empty() {
                    return Err(ValidationError::new("prefab", "must not be empty"));
                }
                require_placement(placement)
            }
            Self::SpawnAvatar {
                entity_uuid,
                avatar,
                placement,
                ..
            } => {
                require_uuid(entity_uuid)?;
                if avatar.is_empty() {
                    return Err(ValidationError::new("avatar", "must not be empty"));
                }
                require_placement(placement)
            }
            Self::DestroyObject { entity_uuid }
            | Self::RequestAuthority { entity_uuid, .. }
            | Self::TransferAuthority { entity_uuid, .. } => require_uuid(entity_uuid),
            Self::UpdatePeers { peers } => {
                let mut indices: Vec<u32> = peers.iter().map(|peer| peer.peer_index).collect();
                indices.sort_unstable();
                let before = indices.len();
                indices.dedup();
                if indices.len() != before {
                    return Err(ValidationError::new("peers", "duplicate peer index"));
                }
                Ok(())
            }
        }
    }

    fn cache_policy(&self) -> CachePolicy {
        match self {
            Self::SpawnObject { .. } | Self::SpawnAvatar { .. } => CachePolicy::On,
            Self::DestroyObject { .. } => CachePolicy::Options(CacheOptions {
                disable: true,
                remove_previous: RemovePrevious::FieldsEqual(vec!["entity_uuid".into()]),
            }),
            Self::TransferAuthority { .. } => CachePolicy::Options(CacheOptions {
                disable: false,
                remove_previous: RemovePrevious::FieldsEqual(vec!["entity_uuid".into()]),
            }),
            Self::UpdatePeers { .. } => CachePolicy::Options(CacheOptions {
                disable: false,
                remove_previous: RemovePrevious::SameGroup,
            }),
            Self::RequestAuthority { .. } => CachePolicy::Off,
        }
    }

    fn topic(&self) -> Option<Topic> {
        Some(Topic::world())
    }

    fn host_only(&self) -> bool {
        matches!(self, Self::TransferAuthority { .. } | Self::UpdatePeers { .. })
    }

    fn cache_group(&self) -> &'static str {
        match self {
            Self::SpawnObject { .. } | Self::SpawnAvatar { .. } | Self::DestroyObject { .. } => {
                OBJECT_CACHE_GROUP
            }
            other => other.action_type(),
        }
    }

    fn field(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "entity_uuid" => self
                .entity_uuid()
                .map(|uuid| serde_json::Value::String(uuid.to_owned())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use flux_actions::{ActionDraft, ActionStore, StoreConfig};

    use super::*;

    fn spawn(uuid: &str) -> WorldAction {
        WorldAction::SpawnObject {
            entity_uuid: uuid.into(),
            owner_user: UserId::new("u1"),
            network_id: 0,
            prefab: "crate".into(),
            placement: Placement::default(),
        }
    }

    #[test]
    fn test_avatar_is_a_spawn_object() {
        let avatar = WorldAction::SpawnAvatar {
            entity_uuid: "a1".into(),
            owner_user: UserId::new("u1"),
            network_id: 1,
            avatar: "robot".into(),
            placement: Placement::default(),
        };
        assert!(avatar.is_type("spawnObject"));
        assert_eq!(avatar.action_type(), "spawnAvatar");
        assert_eq!(avatar.cache_group(), OBJECT_CACHE_GROUP);
    }

    #[test]
    fn test_validation() {
        assert!(spawn("e1").validate().is_ok());
        assert_eq!(spawn("").validate().unwrap_err().field, "entity_uuid");

        let bad_rotation = WorldAction::SpawnObject {
            entity_uuid: "e1".into(),
            owner_user: UserId::new("u1"),
            network_id: 0,
            prefab: "crate".into(),
            placement: Placement {
                position: DVec3::ZERO,
                rotation: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
            },
        };
        assert_eq!(bad_rotation.validate().unwrap_err().field, "placement");

        let peer = |id: &str, index| NetworkPeer {
            peer_id: PeerId::new(id),
            peer_index: index,
            user_id: UserId::new(id),
            user_index: index,
        };
        let duplicate = WorldAction::UpdatePeers {
            peers: vec![peer("a", 0), peer("b", 0)],
        };
        assert_eq!(duplicate.validate().unwrap_err().field, "peers");
    }

    #[test]
    fn test_destroy_purges_cached_spawn() {
        let mut store = ActionStore::new(StoreConfig::new(PeerId::new("host")));
        store.dispatch(spawn("e1")).unwrap();
        store.dispatch(spawn("e2")).unwrap();
        store
            .dispatch(WorldAction::DestroyObject {
                entity_uuid: "e1".into(),
            })
            .unwrap();
        store.apply_incoming();

        assert_eq!(store.history().len(), 3);
        let cached: Vec<&str> = store
            .cached()
            .iter()
            .filter_map(|action| action.payload().entity_uuid())
            .collect();
        assert_eq!(cached, vec!["e2"]);
        assert_eq!(store.history()[0].topic(), &Topic::world());
    }

    #[test]
    fn test_peer_snapshot_replaces_previous() {
        let mut store = ActionStore::new(StoreConfig::new(PeerId::new("host")));
        for count in 1..=3u32 {
            let peers = (0..count)
                .map(|index| NetworkPeer {
                    peer_id: PeerId::new(format!("p{index}")),
                    peer_index: index,
                    user_id: UserId::new(format!("u{index}")),
                    user_index: index,
                })
                .collect();
            store
                .dispatch(ActionDraft::new(WorldAction::UpdatePeers { peers }))
                .unwrap();
        }
        store.apply_incoming();
        assert_eq!(store.cached().len(), 1);
        match store.cached()[0].payload() {
            WorldAction::UpdatePeers { peers } => assert_eq!(peers.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_world_action_survives_postcard() {
        let action = spawn("e1");
        let bytes = postcard::to_allocvec(&action).unwrap();
        let decoded: WorldAction = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, action);
    }
}
