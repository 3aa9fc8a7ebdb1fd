//! Action selection for queues and receptors.

use std::fmt;

use crate::action::{Action, ActionPayload};

/// Selects actions for a consumer queue or receptor.
///
/// Type matching walks the whole type chain, so a matcher on `"spawnObject"`
/// also accepts actions that extend it.
pub enum ActionMatcher<A> {
    /// Every action.
    Any,
    /// Actions whose type chain contains the tag.
    Type(&'static str),
    /// Actions whose type chain contains any of the tags.
    AnyOf(Vec<&'static str>),
    /// Arbitrary predicate.
    Predicate(fn(&Action<A>) -> bool),
}

impl<A: ActionPayload> ActionMatcher<A> {
    pub fn matches(&self, action: &Action<A>) -> bool {
        match self {
            Self::Any => true,
            Self::Type(tag) => action.payload().is_type(tag),
            Self::AnyOf(tags) => tags.iter().any(|tag| action.payload().is_type(tag)),
            Self::Predicate(predicate) => predicate(action),
        }
    }

    /// Tags this matcher selects by, or `None` for matchers that can accept
    /// any type.
    pub(crate) fn type_tags(&self) -> Option<Vec<&'static str>> {
        match self {
            Self::Type(tag) => Some(vec![*tag]),
            Self::AnyOf(tags) => Some(tags.clone()),
            Self::Any | Self::Predicate(_) => None,
        }
    }
}

impl<A> Clone for ActionMatcher<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Any => Self::Any,
            Self::Type(tag) => Self::Type(tag),
            Self::AnyOf(tags) => Self::AnyOf(tags.clone()),
            Self::Predicate(predicate) => Self::Predicate(*predicate),
        }
    }
}

impl<A> fmt::Debug for ActionMatcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Type(tag) => f.debug_tuple("Type").field(tag).finish(),
            Self::AnyOf(tags) => f.debug_tuple("AnyOf").field(tags).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl<A> From<&'static str> for ActionMatcher<A> {
    fn from(tag: &'static str) -> Self {
        Self::Type(tag)
    }
}
