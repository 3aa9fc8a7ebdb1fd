//! Abstract byte transport consumed by routing and replication.

use flux_actions::PeerId;

/// Delivery class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, reliable. Carries action batches.
    Reliable,
    /// Unordered, lossy. Carries entity frames.
    Unreliable,
}

/// Fire-and-forget send primitives. Implementations hand bytes to the
/// underlying connection without blocking and must deliver each message
/// whole or not at all.
pub trait Transport {
    /// Sends one message to a single peer.
    fn send_to_peer(&mut self, peer: &PeerId, channel: Channel, bytes: Vec<u8>);

    /// Sends one message to every other peer of the network.
    fn broadcast(&mut self, channel: Channel, bytes: Vec<u8>);
}
