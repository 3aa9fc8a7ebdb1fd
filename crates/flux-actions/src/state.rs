//! Reduced state: definitions, receptors, and the type-erased slots the
//! store keeps them in.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::action::{Action, ActionPayload};
use crate::error::ReceptorError;
use crate::matcher::ActionMatcher;
use crate::queue::ActionQueue;

/// Fold function of a receptor. Must mutate atomically: on `Err` the state
/// is expected to be unchanged.
pub type ReceptorFn<S, A> = fn(&mut S, &Action<A>) -> Result<(), ReceptorError>;

/// A named fold from actions of a given shape into a state.
pub struct Receptor<S, A> {
    name: &'static str,
    matcher: ActionMatcher<A>,
    fold: ReceptorFn<S, A>,
}

impl<S, A: ActionPayload> Receptor<S, A> {
    pub fn new(name: &'static str, matcher: impl Into<ActionMatcher<A>>, fold: ReceptorFn<S, A>) -> Self {
        Self {
            name,
            matcher: matcher.into(),
            fold,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches_action(&self, action: &Action<A>) -> bool {
        self.matcher.matches(action)
    }

    /// Runs the fold directly, bypassing the store.
    pub fn apply(&self, state: &mut S, action: &Action<A>) -> Result<(), ReceptorError> {
        (self.fold)(state, action)
    }
}

impl<S, A> fmt::Debug for Receptor<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receptor")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Declaration of a reduced state, registered once with
/// [`crate::ActionStore::register_state`].
pub struct StateDefinition<S, A> {
    name: &'static str,
    initial: fn() -> S,
    receptors: Vec<Receptor<S, A>>,
    reactor: Option<Box<dyn FnMut(&S)>>,
}

impl<S: 'static, A: ActionPayload> StateDefinition<S, A> {
    pub fn new(name: &'static str, initial: fn() -> S) -> Self {
        Self {
            name,
            initial,
            receptors: Vec::new(),
            reactor: None,
        }
    }

    /// Appends a receptor. Receptors run in declaration order.
    pub fn receptor(mut self, receptor: Receptor<S, A>) -> Self {
        self.receptors.push(receptor);
        self
    }

    /// Side effect run after every reducer pass that applied an action.
    pub fn reactor(mut self, reactor: impl FnMut(&S) + 'static) -> Self {
        self.reactor = Some(Box::new(reactor));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn into_slot(self) -> StateSlot<A> {
        let name = self.name;
        let initial = self.initial;
        let receptors = self
            .receptors
            .into_iter()
            .map(|receptor| {
                let fold = receptor.fold;
                let receptor_name = receptor.name;
                ErasedReceptor {
                    name: receptor_name,
                    matcher: receptor.matcher,
                    fold: Box::new(move |state: &mut dyn Any, action: &Action<A>| {
                        let state = state
                            .downcast_mut::<S>()
                            .ok_or(ReceptorError::StateType(receptor_name))?;
                        fold(state, action)
                    }),
                }
            })
            .collect();
        let reactor = self.reactor.map(|mut reactor| {
            Box::new(move |state: &dyn Any| {
                if let Some(state) = state.downcast_ref::<S>() {
                    reactor(state);
                }
            }) as Box<dyn FnMut(&dyn Any)>
        });

        StateSlot {
            name,
            value: Box::new(initial()),
            reset: Box::new(move || Box::new(initial()) as Box<dyn Any>),
            receptors,
            reactor,
            queue: None,
            version: 0,
        }
    }
}

/// Typed handle to a registered state.
pub struct StateHandle<S> {
    pub(crate) index: usize,
    _marker: PhantomData<fn() -> S>,
}

impl<S> StateHandle<S> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for StateHandle<S> {}

impl<S> PartialEq for StateHandle<S> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<S> Eq for StateHandle<S> {}

impl<S> fmt::Debug for StateHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateHandle").field(&self.index).finish()
    }
}

// ---------------------------------------------------------------------------
// Erased storage
// ---------------------------------------------------------------------------

type ErasedFold<A> = Box<dyn Fn(&mut dyn Any, &Action<A>) -> Result<(), ReceptorError>>;

pub(crate) struct ErasedReceptor<A> {
    pub(crate) name: &'static str,
    pub(crate) matcher: ActionMatcher<A>,
    fold: ErasedFold<A>,
}

/// Outcome of one reducer pass over a slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReduceOutcome {
    pub(crate) applied: usize,
    pub(crate) errors: usize,
    pub(crate) resynced: bool,
}

pub(crate) struct StateSlot<A> {
    pub(crate) name: &'static str,
    pub(crate) value: Box<dyn Any>,
    reset: Box<dyn Fn() -> Box<dyn Any>>,
    pub(crate) receptors: Vec<ErasedReceptor<A>>,
    reactor: Option<Box<dyn FnMut(&dyn Any)>>,
    pub(crate) queue: Option<ActionQueue<A>>,
    pub(crate) version: u64,
}

impl<A: ActionPayload> StateSlot<A> {
    /// Matcher for the slot's backing queue: the union of its receptors'
    /// type tags, or everything if any receptor matches by predicate.
    pub(crate) fn queue_matcher(&self) -> ActionMatcher<A> {
        let mut tags = Vec::new();
        for receptor in &self.receptors {
            match receptor.matcher.type_tags() {
                Some(receptor_tags) => tags.extend(receptor_tags),
                None => return ActionMatcher::Any,
            }
        }
        tags.sort_unstable();
        tags.dedup();
        ActionMatcher::AnyOf(tags)
    }

    pub(crate) fn accepts(&self, action: &Action<A>) -> bool {
        self.receptors.iter().any(|receptor| receptor.matcher.matches(action))
    }

    /// Creates the backing queue, flagged so the next pass replays history.
    pub(crate) fn init_queue(&mut self, history: &[Action<A>]) {
        if self.queue.is_none() {
            let mut queue = ActionQueue::new(self.queue_matcher(), history);
            queue.mark_resync();
            self.queue = Some(queue);
        }
    }

    /// Folds every unconsumed action of the backing queue into the state.
    pub(crate) fn reduce(&mut self, history: &[Action<A>]) -> ReduceOutcome {
        let Some(queue) = self.queue.as_mut() else {
            return ReduceOutcome::default();
        };
        let batch = queue.drain(history);
        let mut outcome = ReduceOutcome {
            resynced: batch.resynced,
            ..ReduceOutcome::default()
        };
        if batch.resynced {
            self.value = (self.reset)();
        }

        for action in batch.actions {
            let mut touched = false;
            for receptor in &self.receptors {
                if !receptor.matcher.matches(action) {
                    continue;
                }
                touched = true;
                if let Err(err) = (receptor.fold)(self.value.as_mut(), action) {
                    outcome.errors += 1;
                    tracing::error!(
                        state = self.name,
                        receptor = receptor.name,
                        action_type = action.action_type(),
                        uuid = %action.uuid(),
                        "receptor failed: {err}"
                    );
                }
            }
            if touched {
                outcome.applied += 1;
            }
        }

        if outcome.applied > 0 || outcome.resynced {
            self.version += 1;
            if let Some(reactor) = self.reactor.as_mut() {
                reactor(self.value.as_ref());
            }
        }
        outcome
    }
}
