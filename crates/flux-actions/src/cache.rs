//! Cached-action list maintenance.

use crate::action::{Action, ActionPayload, CachePolicy, PeerId, RemovePrevious};

/// Applies `action`'s `$cache` policy to the cached list.
pub(crate) fn update_cached<A: ActionPayload>(cached: &mut Vec<Action<A>>, action: &Action<A>) {
    match action.cache() {
        CachePolicy::Off => {}
        CachePolicy::On => cached.push(action.clone()),
        CachePolicy::Options(options) => {
            let before = cached.len();
            match &options.remove_previous {
                RemovePrevious::None => {}
                RemovePrevious::SameGroup => {
                    cached.retain(|previous| !same_group(previous, action));
                }
                RemovePrevious::FieldsEqual(fields) => {
                    cached.retain(|previous| {
                        !(same_group(previous, action) && fields_equal(previous, action, fields))
                    });
                }
            }
            let removed = before - cached.len();
            if removed > 0 {
                tracing::trace!(
                    action_type = action.action_type(),
                    removed,
                    "removed previous cached actions"
                );
            }
            if !options.disable {
                cached.push(action.clone());
            }
        }
    }
}

/// Removes every cached action authored by `peer`. Returns how many went.
pub(crate) fn remove_for_peer<A: ActionPayload>(cached: &mut Vec<Action<A>>, peer: &PeerId) -> usize {
    let before = cached.len();
    cached.retain(|action| action.peer() != peer);
    before - cached.len()
}

fn same_group<A: ActionPayload>(previous: &Action<A>, incoming: &Action<A>) -> bool {
    previous.peer() == incoming.peer()
        && previous.payload().cache_group() == incoming.payload().cache_group()
}

fn fields_equal<A: ActionPayload>(previous: &Action<A>, incoming: &Action<A>, fields: &[String]) -> bool {
    fields
        .iter()
        .all(|field| previous.payload().field(field) == incoming.payload().field(field))
}
