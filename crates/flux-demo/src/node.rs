//! One simulated participant: an action store, a peer registry and an ECS
//! world replicated through entity frames.

use bevy_ecs::prelude::*;
use flux_actions::{ActionStore, PeerId, StateHandle, StoreConfig, Topic, Uuid};
use flux_config::Config;
use flux_net::{
    AuthorityGrants, Channel, CodecSettings, EntityFrameReader, EntityFrameWriter, IncomingFrames,
    Network, NetworkError, NetworkHooks, NetworkObject, NetworkObjectIndex, NetworkObjectState,
    NetworkPeer, Networks, Placement, SerializationSchema, ShadowStore, SyncReport, Transform, Transport,
    UserId, Velocity, WorldAction, apply_peer_snapshot, handle_peer_joined, handle_peer_left,
    network_object_state, receive_action_batch, send_cached_actions, send_outgoing_actions,
    sync_world,
};
use flux_wire::EnvelopeConfig;
use glam::{DVec3, Quat, Vec3};

use crate::loopback::Outbox;

pub const NETWORK_ID: &str = "world-net";

/// Logs peer lifecycle events.
struct LoggingHooks;

impl NetworkHooks for LoggingHooks {
    fn on_peer_joined(&mut self, network: &Network, peer: &NetworkPeer) {
        tracing::info!(network = %network.id, peer = %peer.peer_id, index = peer.peer_index, "peer joined");
    }

    fn on_peer_left(&mut self, network: &Network, peer: &NetworkPeer) {
        tracing::info!(network = %network.id, peer = %peer.peer_id, "peer left");
    }
}

/// Per-tick counters, summed for the final report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub actions_applied: usize,
    pub frames_sent: usize,
    pub frames_applied: usize,
    pub frames_dropped: usize,
}

impl std::ops::AddAssign for TickStats {
    fn add_assign(&mut self, other: Self) {
        self.actions_applied += other.actions_applied;
        self.frames_sent += other.frames_sent;
        self.frames_applied += other.frames_applied;
        self.frames_dropped += other.frames_dropped;
    }
}

pub struct Node {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub outbox: Outbox,
    store: ActionStore<WorldAction>,
    objects: StateHandle<NetworkObjectState>,
    networks: Networks,
    topic: Topic,
    grants: AuthorityGrants,
    world: World,
    index: NetworkObjectIndex,
    shadows: ShadowStore,
    schema: SerializationSchema,
    writer: EntityFrameWriter,
    reader: EntityFrameReader,
    incoming: IncomingFrames,
    envelope: EnvelopeConfig,
    jitter_delay_ms: f64,
    tick_ms: f64,
    simulation_time: f64,
    stats: TickStats,
}

impl Node {
    /// Creates a node connected to the world network hosted by `host`.
    pub fn new(peer_id: PeerId, user_id: UserId, host: PeerId, config: &Config) -> Result<Self, NetworkError> {
        let mut store = ActionStore::new(StoreConfig::from_config(peer_id.clone(), config));
        let objects = store.register_state(network_object_state())?;
        let grants = AuthorityGrants::new(&mut store);

        let topic = Topic::new(config.network.default_topic.clone());
        let hosting = peer_id == host;
        if hosting {
            store.forward_topic(topic.clone());
        }
        let mut networks = Networks::new();
        let network = networks.connect(Network::new(NETWORK_ID, topic.clone(), host))?;
        if hosting {
            network.add_peer(peer_id.clone(), user_id.clone());
            network.ready = true;
        }

        let settings = CodecSettings::from_config(&config.network);
        Ok(Self {
            outbox: Outbox::default(),
            store,
            objects,
            networks,
            topic,
            grants,
            world: World::new(),
            index: NetworkObjectIndex::new(),
            shadows: ShadowStore::new(),
            schema: SerializationSchema::standard(),
            writer: EntityFrameWriter::new(settings),
            reader: EntityFrameReader::new(settings),
            incoming: IncomingFrames::new(peer_id.clone()),
            envelope: EnvelopeConfig {
                compression_threshold: config.network.compression_threshold,
                compression_enabled: true,
            },
            jitter_delay_ms: config.network.jitter_buffer_delay_ms,
            tick_ms: config.network.tick_duration_ms(),
            simulation_time: 0.0,
            stats: TickStats::default(),
            peer_id,
            user_id,
        })
    }

    fn network(&self) -> Option<&Network> {
        self.networks.get(&self.topic)
    }

    pub fn is_host(&self) -> bool {
        self.network()
            .is_some_and(|network| network.is_hosting(&self.peer_id))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.network()
            .map(|network| network.peers().map(|peer| peer.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn history_len(&self) -> usize {
        self.store.history().len()
    }

    /// Registry record of this node as assigned by the host.
    pub fn registry_record(&self, peer: &PeerId) -> Option<NetworkPeer> {
        self.network()?.peer(peer).cloned()
    }

    /// Seeds a peer's registry with records the host assigned.
    pub fn learn_peer(&mut self, peer: NetworkPeer) {
        if let Some(network) = self.networks.get_mut(&self.topic) {
            network.add_peer_with_indices(peer);
            network.ready = true;
        }
    }

    // -- Host-side lifecycle -------------------------------------------------

    /// Registers a joining peer and sends it the cached world actions.
    pub fn admit(&mut self, peer_id: PeerId, user_id: UserId) -> Result<NetworkPeer, NetworkError> {
        let Some(network) = self.networks.get_mut(&self.topic) else {
            return Err(NetworkError::UnknownPeer(peer_id));
        };
        let record = handle_peer_joined(network, &mut self.store, &mut LoggingHooks, peer_id, user_id)?;
        let sent = send_cached_actions(
            &self.store,
            network,
            &record.peer_id,
            &mut self.outbox,
            &self.envelope,
        )?;
        tracing::debug!(peer = %record.peer_id, cached = sent, "late joiner brought up to date");
        Ok(record)
    }

    pub fn release(&mut self, peer_id: &PeerId) -> Result<(), NetworkError> {
        if let Some(network) = self.networks.get_mut(&self.topic) {
            handle_peer_left(network, &mut self.store, self.objects, &mut LoggingHooks, peer_id)?;
        }
        Ok(())
    }

    // -- Actions --------------------------------------------------------------

    pub fn spawn_object(&mut self, prefab: &str, position: DVec3) -> Result<String, NetworkError> {
        let entity_uuid = Uuid::new_v4().to_string();
        let network_id = self.index.allocate_network_id(&self.peer_id);
        self.store.dispatch(WorldAction::SpawnObject {
            entity_uuid: entity_uuid.clone(),
            owner_user: self.user_id.clone(),
            network_id,
            prefab: prefab.to_owned(),
            placement: Placement {
                position,
                rotation: Quat::IDENTITY,
            },
        })?;
        Ok(entity_uuid)
    }

    pub fn spawn_avatar(&mut self, avatar: &str, position: DVec3) -> Result<String, NetworkError> {
        let entity_uuid = Uuid::new_v4().to_string();
        let network_id = self.index.allocate_network_id(&self.peer_id);
        self.store.dispatch(WorldAction::SpawnAvatar {
            entity_uuid: entity_uuid.clone(),
            owner_user: self.user_id.clone(),
            network_id,
            avatar: avatar.to_owned(),
            placement: Placement {
                position,
                rotation: Quat::IDENTITY,
            },
        })?;
        Ok(entity_uuid)
    }

    pub fn request_authority(&mut self, entity_uuid: &str) -> Result<(), NetworkError> {
        self.store.dispatch(WorldAction::RequestAuthority {
            entity_uuid: entity_uuid.to_owned(),
            requester: self.peer_id.clone(),
        })?;
        Ok(())
    }

    /// Authority holder of an object in this node's view of the world.
    pub fn authority_of(&self, entity_uuid: &str) -> Option<PeerId> {
        self.store
            .state(self.objects)?
            .object(entity_uuid)
            .map(|record| record.authority_peer.clone())
    }

    pub fn object_count(&self) -> usize {
        self.index.len()
    }

    pub fn position_of(&self, entity_uuid: &str) -> Option<DVec3> {
        let entity = self.index.entity_by_uuid(entity_uuid)?;
        self.world
            .get::<Transform>(entity)
            .map(|transform| transform.position)
    }

    // -- Receive --------------------------------------------------------------

    pub fn deliver(&mut self, from: PeerId, channel: Channel, bytes: Vec<u8>) {
        match channel {
            Channel::Reliable => {
                let Some(network) = self.networks.get(&self.topic) else {
                    return;
                };
                if let Err(err) = receive_action_batch(&mut self.store, network, &from, &bytes) {
                    tracing::warn!(peer = %self.peer_id, %from, "action batch rejected: {err}");
                }
            }
            Channel::Unreliable => {
                // Malformed headers are logged by the buffer.
                if self.incoming.push_frame(from, bytes).is_err() {
                    self.stats.frames_dropped += 1;
                }
            }
        }
    }

    // -- Tick -----------------------------------------------------------------

    /// Runs one simulation step and queues this tick's messages.
    pub fn tick(&mut self) -> Result<TickStats, NetworkError> {
        let mut stats = TickStats::default();
        self.simulation_time += self.tick_ms;
        self.store.advance_time(self.tick_ms as u64);

        stats.actions_applied += self.store.apply_incoming().applied;
        if self.is_host() {
            if let Some(network) = self.networks.get(&self.topic) {
                let granted = self.grants.process(&mut self.store, self.objects, network)?;
                if granted > 0 {
                    stats.actions_applied += self.store.apply_incoming().applied;
                }
            }
        } else if let (Some(state), Some(network)) = (
            self.store.state(self.objects),
            self.networks.get_mut(&self.topic),
        ) && apply_peer_snapshot(network, state)
        {
            tracing::debug!(peer = %self.peer_id, peers = network.peer_count(), "peer list updated");
        }

        if let Some(state) = self.store.state(self.objects) {
            let report = sync_world(&mut self.world, &mut self.index, state, &mut self.shadows);
            if report != SyncReport::default() {
                tracing::debug!(peer = %self.peer_id, ?report, "world synchronized");
            }
        }

        self.simulate();
        stats.frames_sent += self.send_frame()?;
        self.apply_frames(&mut stats);

        if let Some(network) = self.networks.get(&self.topic) {
            send_outgoing_actions(&mut self.store, network, &mut self.outbox, &self.envelope)?;
        }

        self.stats += stats;
        Ok(stats)
    }

    /// Moves every object this node has authority over along a circle.
    fn simulate(&mut self) {
        let seconds = self.simulation_time / 1000.0;
        let dt = self.tick_ms / 1000.0;
        let mut query = self
            .world
            .query::<(&NetworkObject, &mut Transform, &mut Velocity)>();
        for (object, mut transform, mut velocity) in query.iter_mut(&mut self.world) {
            if object.authority_peer != self.peer_id {
                continue;
            }
            let phase = seconds + object.network_id as f64;
            let linear = Vec3::new(phase.cos() as f32, 0.0, phase.sin() as f32) * 2.0;
            velocity.linear = linear;
            transform.position += linear.as_dvec3() * dt;
            transform.rotation = Quat::from_rotation_y(phase as f32);
        }
    }

    fn send_frame(&mut self) -> Result<usize, NetworkError> {
        let Some(network) = self.networks.get(&self.topic) else {
            return Ok(0);
        };
        let bytes = match self.writer.write_frame(
            &self.world,
            network,
            &self.index,
            &self.schema,
            &mut self.shadows,
            self.simulation_time,
            &self.peer_id,
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(peer = %self.peer_id, "failed to encode entity frame: {err}");
                return Ok(0);
            }
        };
        if bytes.is_empty() {
            return Ok(0);
        }
        self.outbox.broadcast(Channel::Unreliable, bytes);
        Ok(1)
    }

    fn apply_frames(&mut self, stats: &mut TickStats) {
        let Some(network) = self.networks.get(&self.topic) else {
            return;
        };
        for frame in self
            .incoming
            .drain(self.simulation_time, self.jitter_delay_ms)
        {
            match self.reader.read_frame(
                &mut self.world,
                network,
                &self.index,
                &self.schema,
                &frame.from,
                &frame.bytes,
                &self.peer_id,
            ) {
                Ok(report) => stats.frames_applied += report.applied,
                Err(_) => stats.frames_dropped += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_node() -> Node {
        let host = PeerId::new("host");
        Node::new(host.clone(), UserId::new("user-0"), host, &Config::default()).unwrap()
    }

    #[test]
    fn test_undecodable_frame_counted_as_dropped() {
        let mut node = host_node();
        node.deliver(PeerId::new("peer-1"), Channel::Unreliable, vec![1, 2, 3]);
        assert_eq!(node.stats().frames_dropped, 1);

        // Loopback and empty frames are filtered, not dropped as malformed.
        node.deliver(PeerId::new("host"), Channel::Unreliable, vec![0; 12]);
        node.deliver(PeerId::new("peer-1"), Channel::Unreliable, Vec::new());
        assert_eq!(node.stats().frames_dropped, 1);
    }
}
