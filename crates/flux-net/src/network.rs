//! Network topology and peer registry.
//!
//! A [`Network`] is one connection topology for a topic. Exactly one peer is
//! its host. Every peer gets a small integer index used on the wire in place
//! of its id, and every user gets one as well; both counters only grow, so an
//! index is never handed out twice within a network's lifetime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use flux_actions::{PeerId, Topic};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Wire index of a peer within one network.
pub type PeerIndex = u32;

/// Wire index of a user within one network.
pub type UserIndex = u32;

/// Identifier of a user. One user may be connected through several peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPeer {
    pub peer_id: PeerId,
    pub peer_index: PeerIndex,
    pub user_id: UserId,
    pub user_index: UserIndex,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Peer registry of one topic's connection.
#[derive(Debug, Clone)]
pub struct Network {
    pub id: String,
    pub topic: Topic,
    pub host_peer_id: PeerId,
    /// Set once the transport reports the connection usable.
    pub ready: bool,
    peers: BTreeMap<PeerId, NetworkPeer>,
    peer_index_count: PeerIndex,
    user_index_count: UserIndex,
    peer_index_to_id: HashMap<PeerIndex, PeerId>,
    peer_id_to_index: HashMap<PeerId, PeerIndex>,
    user_index_to_id: HashMap<UserIndex, UserId>,
    user_id_to_index: HashMap<UserId, UserIndex>,
    /// Peers connected on behalf of each user.
    users: HashMap<UserId, Vec<PeerId>>,
}

impl Network {
    pub fn new(id: impl Into<String>, topic: Topic, host_peer_id: PeerId) -> Self {
        Self {
            id: id.into(),
            topic,
            host_peer_id,
            ready: false,
            peers: BTreeMap::new(),
            peer_index_count: 0,
            user_index_count: 0,
            peer_index_to_id: HashMap::new(),
            peer_id_to_index: HashMap::new(),
            user_index_to_id: HashMap::new(),
            user_id_to_index: HashMap::new(),
            users: HashMap::new(),
        }
    }

    pub fn is_hosting(&self, local: &PeerId) -> bool {
        &self.host_peer_id == local
    }

    /// Registers a peer, allocating fresh peer and user indices as needed.
    /// Adding a known peer returns the existing record.
    pub fn add_peer(&mut self, peer_id: PeerId, user_id: UserId) -> &NetworkPeer {
        if self.peers.contains_key(&peer_id) {
            return &self.peers[&peer_id];
        }
        let peer_index = self.peer_index_count;
        let user_index = match self.user_id_to_index.get(&user_id) {
            Some(&index) => index,
            None => self.user_index_count,
        };
        self.insert_peer(NetworkPeer {
            peer_id: peer_id.clone(),
            peer_index,
            user_id,
            user_index,
        });
        &self.peers[&peer_id]
    }

    /// Registers a peer with indices assigned by the host.
    pub fn add_peer_with_indices(&mut self, peer: NetworkPeer) {
        if self.peers.get(&peer.peer_id) == Some(&peer) {
            return;
        }
        self.remove_peer(&peer.peer_id);
        self.insert_peer(peer);
    }

    fn insert_peer(&mut self, peer: NetworkPeer) {
        self.peer_index_count = self.peer_index_count.max(peer.peer_index + 1);
        self.user_index_count = self.user_index_count.max(peer.user_index + 1);
        self.peer_index_to_id
            .insert(peer.peer_index, peer.peer_id.clone());
        self.peer_id_to_index
            .insert(peer.peer_id.clone(), peer.peer_index);
        self.user_index_to_id
            .insert(peer.user_index, peer.user_id.clone());
        self.user_id_to_index
            .insert(peer.user_id.clone(), peer.user_index);
        self.users
            .entry(peer.user_id.clone())
            .or_default()
            .push(peer.peer_id.clone());
        tracing::debug!(
            network = %self.id,
            peer = %peer.peer_id,
            peer_index = peer.peer_index,
            user = %peer.user_id,
            "peer added"
        );
        self.peers.insert(peer.peer_id.clone(), peer);
    }

    /// Removes a peer. The user's index mapping goes with its last peer.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<NetworkPeer> {
        let peer = self.peers.remove(peer_id)?;
        self.peer_index_to_id.remove(&peer.peer_index);
        self.peer_id_to_index.remove(peer_id);
        if let Some(user_peers) = self.users.get_mut(&peer.user_id) {
            user_peers.retain(|id| id != peer_id);
            if user_peers.is_empty() {
                self.users.remove(&peer.user_id);
                self.user_id_to_index.remove(&peer.user_id);
                self.user_index_to_id.remove(&peer.user_index);
            }
        }
        tracing::debug!(network = %self.id, peer = %peer_id, "peer removed");
        Some(peer)
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&NetworkPeer> {
        self.peers.get(peer_id)
    }

    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// All peers, ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &NetworkPeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_index(&self, peer_id: &PeerId) -> Option<PeerIndex> {
        self.peer_id_to_index.get(peer_id).copied()
    }

    pub fn peer_id_for_index(&self, index: PeerIndex) -> Option<&PeerId> {
        self.peer_index_to_id.get(&index)
    }

    pub fn user_index(&self, user_id: &UserId) -> Option<UserIndex> {
        self.user_id_to_index.get(user_id).copied()
    }

    pub fn user_id_for_index(&self, index: UserIndex) -> Option<&UserId> {
        self.user_index_to_id.get(&index)
    }

    /// Peers connected on behalf of a user.
    pub fn user_peers(&self, user_id: &UserId) -> &[PeerId] {
        self.users.get(user_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Next peer index the host will assign.
    pub fn peer_index_count(&self) -> PeerIndex {
        self.peer_index_count
    }

    pub fn user_index_count(&self) -> UserIndex {
        self.user_index_count
    }
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// The connected networks, at most one per topic.
#[derive(Debug, Default)]
pub struct Networks {
    by_topic: BTreeMap<Topic, Network>,
}

impl Networks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a network. A second network on the same topic is rejected.
    pub fn connect(&mut self, network: Network) -> Result<&mut Network, NetworkError> {
        if self.by_topic.contains_key(&network.topic) {
            return Err(NetworkError::TopicInUse(network.topic));
        }
        tracing::info!(network = %network.id, topic = %network.topic, host = %network.host_peer_id, "network connected");
        let topic = network.topic.clone();
        Ok(self.by_topic.entry(topic).or_insert(network))
    }

    pub fn disconnect(&mut self, topic: &Topic) -> Option<Network> {
        let network = self.by_topic.remove(topic)?;
        tracing::info!(network = %network.id, %topic, "network disconnected");
        Some(network)
    }

    pub fn get(&self, topic: &Topic) -> Option<&Network> {
        self.by_topic.get(topic)
    }

    pub fn get_mut(&mut self, topic: &Topic) -> Option<&mut Network> {
        self.by_topic.get_mut(topic)
    }

    pub fn by_id(&self, id: &str) -> Option<&Network> {
        self.by_topic.values().find(|network| network.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Network> {
        self.by_topic.values()
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Peer lifecycle callbacks, invoked directly by the registry helpers in
/// [`crate::objects`].
pub trait NetworkHooks {
    fn on_peer_joined(&mut self, _network: &Network, _peer: &NetworkPeer) {}

    fn on_peer_left(&mut self, _network: &Network, _peer: &NetworkPeer) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl NetworkHooks for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network::new("net-1", Topic::world(), PeerId::new("host"))
    }

    #[test]
    fn test_is_hosting_compares_ids() {
        let network = network();
        assert!(network.is_hosting(&PeerId::new("host")));
        assert!(!network.is_hosting(&PeerId::new("p1")));
    }

    #[test]
    fn test_indices_are_monotonic_and_never_reused() {
        let mut network = network();
        network.add_peer(PeerId::new("host"), UserId::new("u0"));
        network.add_peer(PeerId::new("p1"), UserId::new("u1"));
        assert_eq!(network.peer_index(&PeerId::new("p1")), Some(1));

        network.remove_peer(&PeerId::new("p1"));
        assert_eq!(network.peer_id_for_index(1), None);
        assert_eq!(network.user_index(&UserId::new("u1")), None);

        let rejoined = network.add_peer(PeerId::new("p1"), UserId::new("u1"));
        assert_eq!(rejoined.peer_index, 2);
        assert_eq!(rejoined.user_index, 2);
        assert_eq!(network.peer_index_count(), 3);
    }

    #[test]
    fn test_user_with_two_peers_shares_user_index() {
        let mut network = network();
        let first = network.add_peer(PeerId::new("a"), UserId::new("u")).clone();
        let second = network.add_peer(PeerId::new("b"), UserId::new("u")).clone();
        assert_ne!(first.peer_index, second.peer_index);
        assert_eq!(first.user_index, second.user_index);
        assert_eq!(network.user_peers(&UserId::new("u")).len(), 2);

        network.remove_peer(&PeerId::new("a"));
        assert_eq!(network.user_index(&UserId::new("u")), Some(first.user_index));
        network.remove_peer(&PeerId::new("b"));
        assert!(network.user_peers(&UserId::new("u")).is_empty());
    }

    #[test]
    fn test_adding_known_peer_is_idempotent() {
        let mut network = network();
        let index = network.add_peer(PeerId::new("p1"), UserId::new("u1")).peer_index;
        let again = network.add_peer(PeerId::new("p1"), UserId::new("u1")).peer_index;
        assert_eq!(index, again);
        assert_eq!(network.peer_count(), 1);
    }

    #[test]
    fn test_host_assigned_indices_advance_counters() {
        let mut network = network();
        network.add_peer_with_indices(NetworkPeer {
            peer_id: PeerId::new("p7"),
            peer_index: 7,
            user_id: UserId::new("u7"),
            user_index: 4,
        });
        assert_eq!(network.peer_id_for_index(7), Some(&PeerId::new("p7")));
        assert_eq!(network.user_id_for_index(4), Some(&UserId::new("u7")));
        assert_eq!(network.peer_index_count(), 8);
        assert_eq!(network.user_index_count(), 5);
    }

    #[test]
    fn test_second_network_on_topic_rejected() {
        let mut networks = Networks::new();
        networks.connect(network()).unwrap();
        let err = networks
            .connect(Network::new("net-2", Topic::world(), PeerId::new("other")))
            .unwrap_err();
        assert!(matches!(err, NetworkError::TopicInUse(topic) if topic == Topic::world()));

        networks
            .connect(Network::new("media-1", Topic::media(), PeerId::new("host")))
            .unwrap();
        assert_eq!(networks.by_id("media-1").map(|n| n.topic.clone()), Some(Topic::media()));
        assert!(networks.disconnect(&Topic::world()).is_some());
        assert!(networks.get(&Topic::world()).is_none());
        assert_eq!(networks.iter().count(), 1);
    }
}
