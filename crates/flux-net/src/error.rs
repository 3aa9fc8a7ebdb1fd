//! Errors for network registry, routing and the entity frame codec.

use flux_actions::{ActionError, PeerId, Topic};
use flux_wire::{CursorError, EnvelopeError};

/// Errors from the peer registry and action routing.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Only one network per topic is supported.
    #[error("a network is already connected on topic `{0}`")]
    TopicInUse(Topic),

    /// The peer is not part of the network.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// A non-host peer sent an action batch to a non-host peer.
    #[error("action batch from {from} but the host is {host}")]
    UnexpectedSender {
        /// Transport-reported sender.
        from: PeerId,
        /// The network's host.
        host: PeerId,
    },

    /// Batch encoding or decoding failed.
    #[error("action batch envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Dispatching a host-generated action failed.
    #[error(transparent)]
    Action(#[from] ActionError),
}

/// Errors from encoding or decoding an entity frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A read ran past the end of the frame. The whole frame is dropped.
    #[error("truncated entity frame: {0}")]
    Truncated(CursorError),

    /// Writing the frame failed.
    #[error("failed to encode entity frame: {0}")]
    Encode(CursorError),

    /// A change mask referenced a component the schema does not declare.
    #[error("change mask bit {0} has no component in the schema")]
    UnknownComponent(u8),

    /// Bytes were left over after the declared entries.
    #[error("{0} trailing bytes after entity frame")]
    TrailingBytes(usize),

    /// A schema declared more components than the change mask can address.
    #[error("schema declares {0} components, at most 8 are supported")]
    SchemaTooLarge(usize),
}
