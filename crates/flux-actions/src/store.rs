//! The action store: dispatch, the per-tick apply sweep, consumer queues,
//! reduced state and outgoing topic queues.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::action::{Action, ActionDraft, ActionPayload, PeerId, Topic};
use crate::cache;
use crate::error::ActionError;
use crate::matcher::ActionMatcher;
use crate::queue::{ActionQueue, QueueBatch, QueueHandle, ReactorScope};
use crate::state::{StateDefinition, StateHandle, StateSlot};

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Sent actions kept per topic by default for [`ActionStore::outgoing_history`].
pub const DEFAULT_OUTGOING_HISTORY: usize = 256;

/// Construction parameters for an [`ActionStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Local peer, stamped as `$peer` on dispatched actions.
    pub peer_id: PeerId,
    /// `$topic` for actions that declare none.
    pub default_topic: Topic,
    /// Topics whose applied actions are relayed regardless of author.
    pub forward_topics: Vec<Topic>,
    /// Capture a backtrace into `$stack` on dispatch.
    pub capture_stack: bool,
    /// Most recent sent actions kept per topic; older ones are dropped.
    pub outgoing_history_limit: usize,
}

impl StoreConfig {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            default_topic: Topic::world(),
            forward_topics: Vec::new(),
            capture_stack: false,
            outgoing_history_limit: DEFAULT_OUTGOING_HISTORY,
        }
    }

    /// Builds the store settings from the persisted configuration.
    pub fn from_config(peer_id: PeerId, config: &flux_config::Config) -> Self {
        Self {
            peer_id,
            default_topic: Topic::new(config.network.default_topic.clone()),
            forward_topics: config.actions.forward_topics.iter().map(Topic::new).collect(),
            capture_stack: config.actions.capture_stack,
            outgoing_history_limit: DEFAULT_OUTGOING_HISTORY,
        }
    }
}

/// Counters from one [`ActionStore::apply_incoming`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Actions newly applied (appended to history).
    pub applied: usize,
    /// Actions dropped because their `$uuid` was already known.
    pub duplicates: usize,
    /// Scheduled actions left queued because their `$time` is in the future.
    pub deferred: usize,
    /// Receptor invocations that returned an error.
    pub receptor_errors: usize,
}

#[derive(Debug)]
struct OutgoingQueue<A> {
    pending: Vec<Action<A>>,
    archived: Vec<Action<A>>,
    /// Forwarded actions not applied yet. Applied ones are caught by the
    /// store's known uuids instead.
    forwarded: HashSet<Uuid>,
}

impl<A> Default for OutgoingQueue<A> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            archived: Vec::new(),
            forwarded: HashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionStore
// ---------------------------------------------------------------------------

/// Event-sourced store for one payload family.
///
/// All mutation happens through `&mut self` on the caller's tick.
pub struct ActionStore<A: ActionPayload> {
    config: StoreConfig,
    dispatch_time: u64,
    incoming: Vec<Action<A>>,
    history: Vec<Action<A>>,
    known_uuids: HashSet<Uuid>,
    cached: Vec<Action<A>>,
    outgoing: BTreeMap<Topic, OutgoingQueue<A>>,
    queues: BTreeMap<QueueHandle, ActionQueue<A>>,
    next_queue: u64,
    states: Vec<StateSlot<A>>,
    /// Type tag -> states with a receptor on that tag. Built at registration.
    receptor_table: HashMap<&'static str, Vec<usize>>,
    /// States with a receptor that can match any type.
    wildcard_states: Vec<usize>,
}

impl<A: ActionPayload> ActionStore<A> {
    pub fn new(config: StoreConfig) -> Self {
        tracing::debug!(peer = %config.peer_id, topic = %config.default_topic, "action store created");
        Self {
            config,
            dispatch_time: 0,
            incoming: Vec::new(),
            history: Vec::new(),
            known_uuids: HashSet::new(),
            cached: Vec::new(),
            outgoing: BTreeMap::new(),
            queues: BTreeMap::new(),
            next_queue: 0,
            states: Vec::new(),
            receptor_table: HashMap::new(),
            wildcard_states: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.config.peer_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -- Time ---------------------------------------------------------------

    /// Current logical dispatch time in milliseconds.
    pub fn dispatch_time(&self) -> u64 {
        self.dispatch_time
    }

    pub fn set_dispatch_time(&mut self, time: u64) {
        self.dispatch_time = time;
    }

    pub fn advance_time(&mut self, delta_ms: u64) {
        self.dispatch_time = self.dispatch_time.saturating_add(delta_ms);
    }

    // -- Dispatch -----------------------------------------------------------

    /// Validates, stamps and queues an action. Returns its `$uuid`.
    ///
    /// Nothing is queued when validation fails.
    pub fn dispatch(&mut self, draft: impl Into<ActionDraft<A>>) -> Result<Uuid, ActionError> {
        let draft = draft.into();
        draft
            .payload
            .validate()
            .map_err(|source| ActionError::Validation {
                action_type: draft.payload.action_type(),
                source,
            })?;

        let stack = self
            .config
            .capture_stack
            .then(|| Backtrace::force_capture().to_string());
        let action = Action::stamp(
            draft,
            &self.config.peer_id,
            self.dispatch_time,
            &self.config.default_topic,
            stack,
        );
        let uuid = action.uuid();
        tracing::trace!(action_type = action.action_type(), %uuid, time = action.time(), "dispatch");

        self.outgoing.entry(action.topic().clone()).or_default();
        self.incoming.push(action);
        Ok(uuid)
    }

    /// Queues actions received from a remote peer over network `network_id`.
    ///
    /// Each action is re-validated and tagged with `$network`. With
    /// `verify_sender` set, actions whose `$peer` is not `from` are dropped.
    /// Returns the number of actions accepted.
    pub fn receive(
        &mut self,
        network_id: &str,
        from: &PeerId,
        actions: Vec<Action<A>>,
        verify_sender: bool,
    ) -> usize {
        let mut accepted = 0;
        for action in actions {
            if let Err(err) = action.payload().validate() {
                tracing::warn!(
                    %from,
                    action_type = action.action_type(),
                    "dropping invalid remote action: {err}"
                );
                continue;
            }
            if verify_sender && action.peer() != from {
                tracing::warn!(
                    %from,
                    claimed = %action.peer(),
                    action_type = action.action_type(),
                    "dropping remote action with forged $peer"
                );
                continue;
            }
            self.incoming.push(action.with_network(network_id));
            accepted += 1;
        }
        accepted
    }

    // -- Apply --------------------------------------------------------------

    /// Applies every queued action whose `$time` has arrived, then runs the
    /// state reducers.
    pub fn apply_incoming(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();
        let pending = std::mem::take(&mut self.incoming);

        for action in pending {
            self.forward_if_necessary(&action);

            if action.time() > self.dispatch_time {
                report.deferred += 1;
                self.incoming.push(action);
                continue;
            }

            let uuid = action.uuid();
            if self.known_uuids.contains(&uuid) {
                tracing::trace!(%uuid, action_type = action.action_type(), "duplicate action ignored");
                report.duplicates += 1;
                continue;
            }

            cache::update_cached(&mut self.cached, &action);
            self.init_state_queues(&action);

            let index = self.history.len();
            self.history.push(action);
            let history = &self.history;
            for queue in self.queues.values_mut() {
                if queue.matches(&history[index]) {
                    queue.push(index, history);
                }
            }
            for slot in &mut self.states {
                if let Some(queue) = slot.queue.as_mut()
                    && queue.matches(&history[index])
                {
                    queue.push(index, history);
                }
            }

            self.known_uuids.insert(uuid);
            if let Some(queue) = self.outgoing.get_mut(self.history[index].topic()) {
                queue.forwarded.remove(&uuid);
            }
            report.applied += 1;
        }

        for slot in &mut self.states {
            let outcome = slot.reduce(&self.history);
            report.receptor_errors += outcome.errors;
            if outcome.resynced {
                tracing::debug!(state = slot.name, version = slot.version, "state resynced");
            }
        }

        if report.deferred > 0 {
            tracing::debug!(deferred = report.deferred, "scheduled actions waiting");
        }
        report
    }

    fn forward_if_necessary(&mut self, action: &Action<A>) {
        let authored_here = action.peer() == &self.config.peer_id;
        if !authored_here && !self.config.forward_topics.contains(action.topic()) {
            return;
        }
        let uuid = action.uuid();
        if self.known_uuids.contains(&uuid) {
            return;
        }
        let queue = self.outgoing.entry(action.topic().clone()).or_default();
        if queue.forwarded.insert(uuid) {
            queue.pending.push(action.clone());
        }
    }

    /// Creates the backing queue of every state that has not seen an action
    /// of this type yet.
    fn init_state_queues(&mut self, action: &Action<A>) {
        let mut candidates: Vec<usize> = action
            .payload()
            .types()
            .iter()
            .filter_map(|tag| self.receptor_table.get(tag))
            .flatten()
            .copied()
            .chain(self.wildcard_states.iter().copied())
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        for index in candidates {
            let slot = &mut self.states[index];
            if slot.queue.is_none() && slot.accepts(action) {
                tracing::trace!(state = slot.name, "state queue created");
                slot.init_queue(&self.history);
            }
        }
    }

    // -- Forwarding ---------------------------------------------------------

    /// Relay every action applied on `topic`, not only local ones. Hosts
    /// enable this for the topics they serve.
    pub fn forward_topic(&mut self, topic: Topic) {
        if !self.config.forward_topics.contains(&topic) {
            tracing::debug!(%topic, "forwarding enabled");
            self.config.forward_topics.push(topic);
        }
    }

    pub fn stop_forwarding(&mut self, topic: &Topic) {
        self.config.forward_topics.retain(|forwarded| forwarded != topic);
    }

    pub fn is_forwarding(&self, topic: &Topic) -> bool {
        self.config.forward_topics.contains(topic)
    }

    // -- Outgoing -----------------------------------------------------------

    /// Topics with an outgoing queue.
    pub fn outgoing_topics(&self) -> impl Iterator<Item = &Topic> {
        self.outgoing.keys()
    }

    /// Actions waiting to be sent on `topic`.
    pub fn outgoing(&self, topic: &Topic) -> &[Action<A>] {
        self.outgoing
            .get(topic)
            .map(|queue| queue.pending.as_slice())
            .unwrap_or_default()
    }

    /// Moves the pending actions of `topic` into its sent history.
    pub fn archive_outgoing(&mut self, topic: &Topic) -> usize {
        let Some(queue) = self.outgoing.get_mut(topic) else {
            return 0;
        };
        let count = queue.pending.len();
        queue.archived.append(&mut queue.pending);
        let excess = queue
            .archived
            .len()
            .saturating_sub(self.config.outgoing_history_limit);
        queue.archived.drain(..excess);
        count
    }

    /// Most recently sent actions on `topic`, oldest first, up to
    /// [`StoreConfig::outgoing_history_limit`].
    pub fn outgoing_history(&self, topic: &Topic) -> &[Action<A>] {
        self.outgoing
            .get(topic)
            .map(|queue| queue.archived.as_slice())
            .unwrap_or_default()
    }

    // -- Inspection ---------------------------------------------------------

    /// Append-only log of applied actions, in apply order.
    pub fn history(&self) -> &[Action<A>] {
        &self.history
    }

    /// Latest-state actions retained by `$cache`.
    pub fn cached(&self) -> &[Action<A>] {
        &self.cached
    }

    /// Actions not yet applied, including scheduled ones.
    pub fn incoming(&self) -> &[Action<A>] {
        &self.incoming
    }

    pub fn is_known(&self, uuid: Uuid) -> bool {
        self.known_uuids.contains(&uuid)
    }

    /// Drops every cached action authored by a departed peer.
    pub fn remove_cached_for_peer(&mut self, peer: &PeerId) -> usize {
        let removed = cache::remove_for_peer(&mut self.cached, peer);
        if removed > 0 {
            tracing::debug!(%peer, removed, "removed cached actions of departed peer");
        }
        removed
    }

    // -- Consumer queues ----------------------------------------------------

    /// Creates a queue pre-filled with every matching applied action.
    pub fn create_queue(&mut self, matcher: impl Into<ActionMatcher<A>>) -> QueueHandle {
        let handle = QueueHandle(self.next_queue);
        self.next_queue += 1;
        self.queues
            .insert(handle, ActionQueue::new(matcher.into(), &self.history));
        handle
    }

    /// Creates a queue owned by `scope`.
    pub fn create_scoped_queue(
        &mut self,
        scope: &mut ReactorScope,
        matcher: impl Into<ActionMatcher<A>>,
    ) -> QueueHandle {
        let handle = self.create_queue(matcher);
        scope.queues.push(handle);
        handle
    }

    pub fn remove_queue(&mut self, handle: QueueHandle) -> bool {
        self.queues.remove(&handle).is_some()
    }

    /// Removes every queue the scope owns.
    pub fn destroy_scope(&mut self, scope: ReactorScope) -> usize {
        scope
            .queues
            .into_iter()
            .filter(|handle| self.remove_queue(*handle))
            .count()
    }

    /// Actions the queue has not delivered yet, in `$time` order.
    pub fn next_actions(&mut self, handle: QueueHandle) -> Result<QueueBatch<'_, A>, ActionError> {
        let queue = self
            .queues
            .get_mut(&handle)
            .ok_or(ActionError::UnknownQueue(handle))?;
        Ok(queue.drain(&self.history))
    }

    /// Number of actions a queue holds, delivered or not.
    pub fn queue_len(&self, handle: QueueHandle) -> Option<usize> {
        self.queues.get(&handle).map(ActionQueue::len)
    }

    /// `true` if the queue's next batch will replay from the start.
    pub fn queue_needs_resync(&self, handle: QueueHandle) -> Option<bool> {
        self.queues.get(&handle).map(ActionQueue::needs_resync)
    }

    // -- States -------------------------------------------------------------

    /// Registers a reduced state. Names must be unique.
    ///
    /// If history already holds matching actions the state is reduced
    /// immediately.
    pub fn register_state<S: 'static>(
        &mut self,
        definition: StateDefinition<S, A>,
    ) -> Result<StateHandle<S>, ActionError> {
        let name = definition.name();
        if self.states.iter().any(|slot| slot.name == name) {
            return Err(ActionError::DuplicateState(name));
        }

        let index = self.states.len();
        let mut slot = definition.into_slot();
        let mut wildcard = false;
        for receptor in &slot.receptors {
            match receptor.matcher.type_tags() {
                Some(tags) => {
                    for tag in tags {
                        let states = self.receptor_table.entry(tag).or_default();
                        if !states.contains(&index) {
                            states.push(index);
                        }
                    }
                }
                None => wildcard = true,
            }
        }
        if wildcard {
            self.wildcard_states.push(index);
        }

        if self.history.iter().any(|action| slot.accepts(action)) {
            slot.init_queue(&self.history);
            slot.reduce(&self.history);
        }
        tracing::debug!(state = name, receptors = slot.receptors.len(), "state registered");
        self.states.push(slot);
        Ok(StateHandle::new(index))
    }

    pub fn state<S: 'static>(&self, handle: StateHandle<S>) -> Option<&S> {
        self.states.get(handle.index)?.value.downcast_ref::<S>()
    }

    /// Incremented by every reducer pass that applied an action or resynced.
    pub fn state_version<S>(&self, handle: StateHandle<S>) -> Option<u64> {
        self.states.get(handle.index).map(|slot| slot.version)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
