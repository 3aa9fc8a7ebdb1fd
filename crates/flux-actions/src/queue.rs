//! Consumer queues over the applied history.
//!
//! A queue holds indices into the store's append-only history, kept sorted by
//! `$time`. When an action arrives with a `$time` earlier than one already
//! queued, the queue is flagged for resync: its next batch starts over from
//! the beginning so the consumer can reset and replay in order.

use crate::action::{Action, ActionPayload};
use crate::matcher::ActionMatcher;

/// Opaque handle to a consumer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle(pub(crate) u64);

/// Actions delivered by one [`crate::ActionStore::next_actions`] call.
#[derive(Debug)]
pub struct QueueBatch<'a, A> {
    /// Actions in `$time` order.
    pub actions: Vec<&'a Action<A>>,
    /// The consumer must discard derived state before folding `actions`;
    /// the batch replays the whole queue.
    pub resynced: bool,
}

impl<A> QueueBatch<'_, A> {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Group of queues created together and torn down together.
#[derive(Debug, Default)]
pub struct ReactorScope {
    pub(crate) queues: Vec<QueueHandle>,
}

impl ReactorScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues owned by this scope.
    pub fn queues(&self) -> &[QueueHandle] {
        &self.queues
    }
}

pub(crate) struct ActionQueue<A> {
    matcher: ActionMatcher<A>,
    entries: Vec<usize>,
    next: usize,
    needs_resync: bool,
}

impl<A: ActionPayload> ActionQueue<A> {
    /// Builds a queue pre-filled with every matching action already applied.
    pub(crate) fn new(matcher: ActionMatcher<A>, history: &[Action<A>]) -> Self {
        let mut queue = Self {
            matcher,
            entries: Vec::new(),
            next: 0,
            needs_resync: false,
        };
        queue.rebuild(history);
        queue
    }

    pub(crate) fn matches(&self, action: &Action<A>) -> bool {
        self.matcher.matches(action)
    }

    /// Inserts `history[index]` at its `$time` position.
    pub(crate) fn push(&mut self, index: usize, history: &[Action<A>]) {
        let time = history[index].time();
        let last_time = self.entries.last().map(|&last| history[last].time());
        match last_time {
            Some(last) if time < last => {
                let at = self
                    .entries
                    .partition_point(|&queued| history[queued].time() <= time);
                self.entries.insert(at, index);
                if at < self.next {
                    self.needs_resync = true;
                }
            }
            _ => self.entries.push(index),
        }
    }

    /// Refilters the full history, sorted stably by `$time`.
    pub(crate) fn rebuild(&mut self, history: &[Action<A>]) {
        self.entries = history
            .iter()
            .enumerate()
            .filter(|(_, action)| self.matcher.matches(action))
            .map(|(index, _)| index)
            .collect();
        self.entries.sort_by_key(|&index| history[index].time());
        self.next = 0;
    }

    pub(crate) fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub(crate) fn mark_resync(&mut self) {
        self.needs_resync = true;
    }

    /// Pending entries, advancing the cursor. After a resync the queue is
    /// rebuilt from history and returned whole.
    pub(crate) fn drain<'a>(&mut self, history: &'a [Action<A>]) -> QueueBatch<'a, A> {
        let resynced = std::mem::take(&mut self.needs_resync);
        if resynced {
            self.rebuild(history);
        }
        let actions = self.entries[self.next..]
            .iter()
            .map(|&index| &history[index])
            .collect();
        self.next = self.entries.len();
        QueueBatch { actions, resynced }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
