//! Moves action batches between stores over the reliable channel.
//!
//! Peers send everything they produced on a topic to the host. The host
//! fans its outgoing queue out to every other peer, filtered by `$to`.

use flux_actions::{Action, ActionPayload, ActionStore, ActionTarget, PeerId};
use flux_wire::{EnvelopeConfig, open, seal};

use crate::error::NetworkError;
use crate::network::Network;
use crate::transport::{Channel, Transport};

/// Counters from one [`send_outgoing_actions`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingReport {
    /// Messages handed to the transport.
    pub batches: usize,
    /// Actions across all messages.
    pub actions: usize,
    /// Actions moved out of the outgoing queue.
    pub archived: usize,
}

/// Sends the outgoing queue of the network's topic and archives it.
///
/// When sealing a batch fails nothing is archived, so the queue is retried
/// on the next pass.
pub fn send_outgoing_actions<A: ActionPayload>(
    store: &mut ActionStore<A>,
    network: &Network,
    transport: &mut dyn Transport,
    envelope: &EnvelopeConfig,
) -> Result<RoutingReport, NetworkError> {
    let local = store.peer_id().clone();
    let pending = store.outgoing(&network.topic);
    if pending.is_empty() {
        return Ok(RoutingReport::default());
    }

    let mut report = if network.is_hosting(&local) {
        send_as_host(pending, network, &local, transport, envelope)?
    } else {
        send_as_peer(pending, network, &local, transport, envelope)?
    };
    report.archived = store.archive_outgoing(&network.topic);
    Ok(report)
}

fn send_as_peer<A: ActionPayload>(
    pending: &[Action<A>],
    network: &Network,
    local: &PeerId,
    transport: &mut dyn Transport,
    envelope: &EnvelopeConfig,
) -> Result<RoutingReport, NetworkError> {
    let batch: Vec<Action<A>> = pending
        .iter()
        .filter(|action| !matches!(action.to(), ActionTarget::Peer(target) if target == local))
        .map(|action| match action.network() {
            Some(id) if id == network.id => action.clone().with_topic(network.topic.clone()),
            _ => action.clone(),
        })
        .collect();
    if batch.is_empty() {
        return Ok(RoutingReport::default());
    }

    let bytes = seal(&batch, envelope)?;
    tracing::trace!(network = %network.id, host = %network.host_peer_id, actions = batch.len(), "sending action batch to host");
    transport.send_to_peer(&network.host_peer_id, Channel::Reliable, bytes);
    Ok(RoutingReport {
        batches: 1,
        actions: batch.len(),
        archived: 0,
    })
}

fn send_as_host<A: ActionPayload>(
    pending: &[Action<A>],
    network: &Network,
    local: &PeerId,
    transport: &mut dyn Transport,
    envelope: &EnvelopeConfig,
) -> Result<RoutingReport, NetworkError> {
    let mut report = RoutingReport::default();
    for peer in network.peers().filter(|peer| &peer.peer_id != local) {
        let batch: Vec<Action<A>> = pending
            .iter()
            .filter(|action| action.network().is_none_or(|id| id == network.id))
            .filter(|action| addressed_to(action, &peer.peer_id))
            .map(|action| action.clone().with_topic(network.topic.clone()))
            .collect();
        if batch.is_empty() {
            continue;
        }

        let bytes = seal(&batch, envelope)?;
        tracing::trace!(network = %network.id, peer = %peer.peer_id, actions = batch.len(), "sending action batch to peer");
        transport.send_to_peer(&peer.peer_id, Channel::Reliable, bytes);
        report.batches += 1;
        report.actions += batch.len();
    }
    Ok(report)
}

fn addressed_to<A: ActionPayload>(action: &Action<A>, peer: &PeerId) -> bool {
    match action.to() {
        ActionTarget::All => true,
        ActionTarget::Others => action.peer() != peer,
        ActionTarget::Peer(target) => target == peer,
    }
}

/// Decodes an action batch from `from` and queues it on the store.
///
/// A host accepts batches from any connected peer but drops actions whose
/// `$peer` is not the sender. A non-host only accepts batches from the host.
/// Host-only actions authored by anyone but the host are dropped on both
/// sides. Returns the number of actions queued.
pub fn receive_action_batch<A: ActionPayload>(
    store: &mut ActionStore<A>,
    network: &Network,
    from: &PeerId,
    bytes: &[u8],
) -> Result<usize, NetworkError> {
    if !network.contains_peer(from) {
        return Err(NetworkError::UnknownPeer(from.clone()));
    }
    let hosting = network.is_hosting(store.peer_id());
    if !hosting && from != &network.host_peer_id {
        return Err(NetworkError::UnexpectedSender {
            from: from.clone(),
            host: network.host_peer_id.clone(),
        });
    }

    let mut actions: Vec<Action<A>> = open(bytes)?;
    let received = actions.len();
    actions.retain(|action| {
        let allowed = !action.payload().host_only() || action.peer() == &network.host_peer_id;
        if !allowed {
            tracing::warn!(
                %from,
                author = %action.peer(),
                action_type = action.action_type(),
                "dropping host-only action not authored by the host"
            );
        }
        allowed
    });
    let accepted = store.receive(&network.id, from, actions, hosting);
    tracing::trace!(network = %network.id, %from, received, accepted, "action batch received");
    Ok(accepted)
}

/// Sends the cached actions of the network's topic to a peer that just
/// joined, so it can rebuild the current state. Returns the number sent.
pub fn send_cached_actions<A: ActionPayload>(
    store: &ActionStore<A>,
    network: &Network,
    peer: &PeerId,
    transport: &mut dyn Transport,
    envelope: &EnvelopeConfig,
) -> Result<usize, NetworkError> {
    let batch: Vec<Action<A>> = store
        .cached()
        .iter()
        .filter(|action| action.topic() == &network.topic)
        .filter(|action| action.network().is_none_or(|id| id == network.id))
        .filter(|action| addressed_to(action, peer))
        .cloned()
        .collect();
    if batch.is_empty() {
        return Ok(0);
    }

    let bytes = seal(&batch, envelope)?;
    tracing::debug!(network = %network.id, %peer, actions = batch.len(), "sending cached actions");
    transport.send_to_peer(peer, Channel::Reliable, bytes);
    Ok(batch.len())
}
