//! Error types for action validation, registration and reduction.

use crate::queue::QueueHandle;

/// A payload field failed its declared constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field `{field}`: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Human-readable reason.
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by [`crate::ActionStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The action was rejected before entering any queue.
    #[error("invalid `{action_type}` action: {source}")]
    Validation {
        /// Primary type tag of the rejected action.
        action_type: &'static str,
        /// The failed constraint.
        #[source]
        source: ValidationError,
    },

    /// A state with this name was already registered.
    #[error("state `{0}` is already registered")]
    DuplicateState(&'static str),

    /// The queue handle does not refer to a live queue.
    #[error("unknown action queue {0:?}")]
    UnknownQueue(QueueHandle),
}

/// Failure inside a receptor. Logged by the store; never aborts a tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceptorError {
    /// The receptor refused the action.
    #[error("{0}")]
    Rejected(String),

    /// The stored state does not have the receptor's state type.
    #[error("state type mismatch in receptor `{0}`")]
    StateType(&'static str),
}
