//! Action definitions: payload trait, envelope metadata, and the draft used
//! to dispatch.
//!
//! An [`Action`] pairs an application payload with the reserved control
//! fields every action carries (`$peer`, `$to`, `$time`, `$topic`, `$cache`,
//! `$uuid`, `$network`, `$stack`). Actions are immutable once stamped by the
//! store; the network layer derives re-targeted copies with the `with_*`
//! methods.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Topic for world state (objects, peers, authority).
pub const WORLD_TOPIC: &str = "world";

/// Topic for media session state.
pub const MEDIA_TOPIC: &str = "media";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a connected peer (one transport connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical channel partitioning peers and routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(pub String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    /// The [`WORLD_TOPIC`] topic.
    pub fn world() -> Self {
        Self::new(WORLD_TOPIC)
    }

    /// The [`MEDIA_TOPIC`] topic.
    pub fn media() -> Self {
        Self::new(MEDIA_TOPIC)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Control fields
// ---------------------------------------------------------------------------

/// Recipients of an action (`$to`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionTarget {
    /// Every peer, including the author.
    #[default]
    All,
    /// Every peer except the author.
    Others,
    /// One specific peer.
    Peer(PeerId),
}

/// Which previously cached actions an incoming cached action replaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovePrevious {
    /// Keep all previous cached actions.
    #[default]
    None,
    /// Remove cached actions from the same peer in the same cache group.
    SameGroup,
    /// Like [`RemovePrevious::SameGroup`], restricted to actions whose listed
    /// payload fields are equal to the incoming action's.
    FieldsEqual(Vec<String>),
}

/// Structured `$cache` options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Do not append the incoming action itself.
    pub disable: bool,
    /// Removal rule applied before appending.
    pub remove_previous: RemovePrevious,
}

/// `$cache` policy of an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Not cached.
    #[default]
    Off,
    /// Appended to the cached list.
    On,
    /// Removal rules, then optionally appended.
    Options(CacheOptions),
}

impl From<bool> for CachePolicy {
    fn from(cached: bool) -> Self {
        if cached { Self::On } else { Self::Off }
    }
}

impl From<CacheOptions> for CachePolicy {
    fn from(options: CacheOptions) -> Self {
        Self::Options(options)
    }
}

// ---------------------------------------------------------------------------
// ActionPayload
// ---------------------------------------------------------------------------

/// Application payload carried by an [`Action`].
///
/// Implemented by an enum with one variant per action type. The type chain
/// returned by [`ActionPayload::types`] lists the most specific tag first; an
/// action that extends another appends the ancestor's tags, so matchers on an
/// ancestor tag accept it.
pub trait ActionPayload: Clone + fmt::Debug + Serialize + DeserializeOwned + 'static {
    /// Type chain, most specific first. Must not be empty.
    fn types(&self) -> &'static [&'static str];

    /// Constructor-level invariant checks. Runs on dispatch and on receipt.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// `$cache` declared by the action's shape, used when the draft sets none.
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Off
    }

    /// `$topic` declared by the action's shape, used when the draft sets none.
    fn topic(&self) -> Option<Topic> {
        None
    }

    /// Actions only the network host may author. Copies from other peers
    /// are dropped on receipt.
    fn host_only(&self) -> bool {
        false
    }

    /// Group used by [`RemovePrevious`] matching. Defaults to the primary type.
    fn cache_group(&self) -> &'static str {
        self.action_type()
    }

    /// Primary (most specific) type tag.
    fn action_type(&self) -> &'static str {
        self.types().first().copied().unwrap_or("")
    }

    /// `true` if `tag` appears anywhere in the type chain.
    fn is_type(&self, tag: &str) -> bool {
        self.types().contains(&tag)
    }

    /// Named payload field as JSON, for field-equality cache rules.
    ///
    /// The default serializes the payload; externally tagged enum variants
    /// (`{"Variant": {..}}`) are looked through.
    fn field(&self, name: &str) -> Option<serde_json::Value> {
        let value = serde_json::to_value(self).ok()?;
        let object = value.as_object()?;
        if let Some(found) = object.get(name) {
            return Some(found.clone());
        }
        match object.values().next() {
            Some(serde_json::Value::Object(inner)) if object.len() == 1 => inner.get(name).cloned(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionDraft
// ---------------------------------------------------------------------------

/// An action before the store stamps its control fields.
///
/// Anything left unset is filled in on dispatch: `$peer` with the local peer,
/// `$time` with the current dispatch time, `$topic` with the payload's or
/// store's default, `$cache` with the payload's policy, `$uuid` fresh.
#[derive(Debug, Clone)]
pub struct ActionDraft<A> {
    pub(crate) payload: A,
    pub(crate) peer: Option<PeerId>,
    pub(crate) to: ActionTarget,
    pub(crate) time: Option<u64>,
    pub(crate) topic: Option<Topic>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) uuid: Option<Uuid>,
}

impl<A: ActionPayload> ActionDraft<A> {
    pub fn new(payload: A) -> Self {
        Self {
            payload,
            peer: None,
            to: ActionTarget::All,
            time: None,
            topic: None,
            cache: None,
            uuid: None,
        }
    }

    pub fn peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn to(mut self, to: ActionTarget) -> Self {
        self.to = to;
        self
    }

    /// Schedule the action: it stays queued until dispatch time reaches `time`.
    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn cache(mut self, cache: impl Into<CachePolicy>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn payload(&self) -> &A {
        &self.payload
    }
}

impl<A: ActionPayload> From<A> for ActionDraft<A> {
    fn from(payload: A) -> Self {
        Self::new(payload)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A stamped, validated action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action<A> {
    payload: A,
    peer: PeerId,
    to: ActionTarget,
    time: u64,
    topic: Topic,
    cache: CachePolicy,
    uuid: Uuid,
    network: Option<String>,
    stack: Option<String>,
}

impl<A: ActionPayload> Action<A> {
    /// Stamps a draft. Validation is the store's job; see
    /// [`crate::ActionStore::dispatch`].
    pub(crate) fn stamp(
        draft: ActionDraft<A>,
        local_peer: &PeerId,
        now: u64,
        default_topic: &Topic,
        stack: Option<String>,
    ) -> Self {
        let topic = draft
            .topic
            .or_else(|| draft.payload.topic())
            .unwrap_or_else(|| default_topic.clone());
        let cache = draft.cache.unwrap_or_else(|| draft.payload.cache_policy());
        Self {
            peer: draft.peer.unwrap_or_else(|| local_peer.clone()),
            to: draft.to,
            time: draft.time.unwrap_or(now),
            topic,
            cache,
            uuid: draft.uuid.unwrap_or_else(Uuid::new_v4),
            network: None,
            stack,
            payload: draft.payload,
        }
    }

    pub fn payload(&self) -> &A {
        &self.payload
    }

    /// `$peer`: the authoring peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// `$to`
    pub fn to(&self) -> &ActionTarget {
        &self.to
    }

    /// `$time`: logical dispatch time in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// `$topic`
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// `$cache`
    pub fn cache(&self) -> &CachePolicy {
        &self.cache
    }

    /// `$uuid`
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// `$network`: id of the network the action arrived on, if remote.
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// `$stack`: dispatch backtrace, when capture is enabled.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Primary type tag of the payload.
    pub fn action_type(&self) -> &'static str {
        self.payload.action_type()
    }

    /// Copy with a different `$topic`.
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    /// Copy tagged with the network it arrived on.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum TestAction {
        Spawn { entity_uuid: String, prefab: String },
        SpawnAvatar { entity_uuid: String, avatar: String },
        Chat(String),
    }

    impl ActionPayload for TestAction {
        fn types(&self) -> &'static [&'static str] {
            match self {
                Self::Spawn { .. } => &["spawn"],
                Self::SpawnAvatar { .. } => &["spawnAvatar", "spawn"],
                Self::Chat(_) => &["chat"],
            }
        }

        fn cache_policy(&self) -> CachePolicy {
            match self {
                Self::Spawn { .. } | Self::SpawnAvatar { .. } => CachePolicy::On,
                Self::Chat(_) => CachePolicy::Off,
            }
        }
    }

    #[test]
    fn test_extended_type_chain() {
        let avatar = TestAction::SpawnAvatar {
            entity_uuid: "e1".into(),
            avatar: "robot".into(),
        };
        assert_eq!(avatar.action_type(), "spawnAvatar");
        assert!(avatar.is_type("spawn"));
        assert!(!TestAction::Chat("hi".into()).is_type("spawn"));
    }

    #[test]
    fn test_field_lookup_through_enum_variant() {
        let spawn = TestAction::Spawn {
            entity_uuid: "e1".into(),
            prefab: "crate".into(),
        };
        assert_eq!(spawn.field("entity_uuid"), Some(serde_json::json!("e1")));
        assert_eq!(spawn.field("missing"), None);
        // Newtype variants have no named fields.
        assert_eq!(TestAction::Chat("x".into()).field("entity_uuid"), None);
    }

    #[test]
    fn test_stamp_fills_defaults() {
        let local = PeerId::new("host");
        let draft = ActionDraft::new(TestAction::Spawn {
            entity_uuid: "e1".into(),
            prefab: "crate".into(),
        });
        let action = Action::stamp(draft, &local, 42, &Topic::world(), None);
        assert_eq!(action.peer(), &local);
        assert_eq!(action.time(), 42);
        assert_eq!(action.topic(), &Topic::world());
        assert_eq!(action.to(), &ActionTarget::All);
        assert_eq!(action.cache(), &CachePolicy::On);
        assert!(action.network().is_none());
        assert!(!action.uuid().is_nil());
    }

    #[test]
    fn test_stamp_keeps_explicit_fields() {
        let uuid = Uuid::from_u128(7);
        let draft = ActionDraft::new(TestAction::Chat("hi".into()))
            .peer(PeerId::new("p2"))
            .to(ActionTarget::Others)
            .time(1000)
            .topic(Topic::media())
            .cache(true)
            .uuid(uuid);
        let action = Action::stamp(draft, &PeerId::new("host"), 5, &Topic::world(), None);
        assert_eq!(action.peer().as_str(), "p2");
        assert_eq!(action.to(), &ActionTarget::Others);
        assert_eq!(action.time(), 1000);
        assert_eq!(action.topic(), &Topic::media());
        assert_eq!(action.cache(), &CachePolicy::On);
        assert_eq!(action.uuid(), uuid);
    }

    #[test]
    fn test_action_postcard_roundtrip() {
        let draft = ActionDraft::new(TestAction::Spawn {
            entity_uuid: "e9".into(),
            prefab: "tree".into(),
        })
        .cache(CacheOptions {
            disable: false,
            remove_previous: RemovePrevious::FieldsEqual(vec!["entity_uuid".into()]),
        });
        let action = Action::stamp(draft, &PeerId::new("a"), 1, &Topic::world(), None)
            .with_network("net-1");
        let bytes = postcard::to_allocvec(&action).unwrap();
        let decoded: Action<TestAction> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, action);
        assert_eq!(decoded.network(), Some("net-1"));
    }
}
