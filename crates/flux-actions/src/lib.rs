//! Event-sourced action store.
//!
//! Application code describes intended state changes as typed, validated
//! [`Action`]s. The [`ActionStore`] queues them, applies each exactly once
//! (deduplicated by `$uuid`), keeps an append-only history plus a list of
//! cached "latest state" actions, feeds consumer queues, folds actions into
//! registered states through [`Receptor`]s, and stages them in per-topic
//! outgoing queues for the network layer to route.
//!
//! Everything runs on the caller's tick: [`ActionStore::apply_incoming`] is
//! the only place actions move from incoming to applied.

pub mod action;
pub mod error;
pub mod matcher;
pub mod queue;
pub mod state;
pub mod store;

mod cache;

pub use action::{
    Action, ActionDraft, ActionPayload, ActionTarget, CacheOptions, CachePolicy, MEDIA_TOPIC,
    PeerId, RemovePrevious, Topic, WORLD_TOPIC,
};
pub use error::{ActionError, ReceptorError, ValidationError};
pub use matcher::ActionMatcher;
pub use queue::{QueueBatch, QueueHandle, ReactorScope};
pub use state::{Receptor, StateDefinition, StateHandle};
pub use store::{ActionStore, ApplyReport, DEFAULT_OUTGOING_HISTORY, StoreConfig};
pub use uuid::Uuid;
