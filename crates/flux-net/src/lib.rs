//! Host/peer networking: peer registry, action routing, replicated objects
//! and the entity delta codec with its jitter buffer.

pub mod components;
pub mod error;
pub mod jitter;
pub mod network;
pub mod objects;
pub mod routing;
pub mod serialization;
pub mod transport;
pub mod world_actions;

pub use components::{NetworkId, NetworkObject, NetworkObjectIndex, Transform, Velocity};
pub use error::{FrameError, NetworkError};
pub use jitter::{IncomingFrames, JitterBuffer, ReceivedFrame};
pub use network::{
    Network, NetworkHooks, NetworkPeer, Networks, NoHooks, PeerIndex, UserId, UserIndex,
};
pub use objects::{
    AuthorityGrants, NetworkObjectState, ObjectKind, ObjectRecord, SyncReport,
    apply_peer_snapshot, handle_peer_joined, handle_peer_left, network_object_state, sync_world,
};
pub use routing::{RoutingReport, receive_action_batch, send_cached_actions, send_outgoing_actions};
pub use serialization::{
    CodecSettings, ComponentSerializer, EntityFrameReader, EntityFrameWriter, FrameReport,
    MAX_SCHEMA_COMPONENTS, ReadFn, SerializationSchema, ShadowStore, TRANSFORM, VELOCITY, WriteFn,
    frame_time,
};
pub use transport::{Channel, Transport};
pub use world_actions::{OBJECT_CACHE_GROUP, Placement, WorldAction};
