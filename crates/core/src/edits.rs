//! Bookkeeping for local edits the remote store has not confirmed yet, and
//! for the per-collection debounce timers.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;

use crate::models::CollectionKind;
use crate::reconcile::IdMapping;

/// Ids changed or deleted locally since their collection was last pushed.
///
/// A change event for a dirty id describes an older version than the local
/// record. An insert or update for a deleted id is the echo of a push that
/// raced the delete.
#[derive(Debug, Default)]
pub struct EditLog {
    dirty: HashMap<CollectionKind, HashSet<String>>,
    deleted: HashMap<CollectionKind, HashSet<String>>,
}

impl EditLog {
    pub fn touch<I, S>(&mut self, kind: CollectionKind, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dirty
            .entry(kind)
            .or_default()
            .extend(ids.into_iter().map(Into::into));
    }

    /// Called when a snapshot of `kind` is taken for a push.
    pub fn clear_dirty(&mut self, kind: CollectionKind) {
        self.dirty.remove(&kind);
    }

    pub fn delete<I, S>(&mut self, kind: CollectionKind, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dirty = self.dirty.entry(kind).or_default();
        let deleted = self.deleted.entry(kind).or_default();
        for id in ids {
            let id = id.into();
            dirty.remove(&id);
            deleted.insert(id);
        }
    }

    pub fn is_deleted(&self, kind: CollectionKind, id: &str) -> bool {
        self.deleted.get(&kind).is_some_and(|ids| ids.contains(id))
    }

    /// Whether an insert or update event for `id` must not replace local
    /// state.
    pub fn shadows(&self, kind: CollectionKind, id: &str) -> bool {
        self.is_deleted(kind, id) || self.dirty.get(&kind).is_some_and(|ids| ids.contains(id))
    }

    /// Follows temporary ids to the permanent ids the store assigned.
    pub fn remap(&mut self, kind: CollectionKind, mapping: &IdMapping) {
        if mapping.is_empty() {
            return;
        }
        for set in [self.dirty.get_mut(&kind), self.deleted.get_mut(&kind)]
            .into_iter()
            .flatten()
        {
            for (old_id, new_id) in mapping.iter() {
                if set.remove(old_id) {
                    set.insert(new_id.to_string());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.dirty.clear();
        self.deleted.clear();
    }
}

/// One pending debounce timer per collection, tagged with the generation
/// that created it.
#[derive(Debug, Default)]
pub struct DebounceTimers {
    generation: u64,
    timers: HashMap<CollectionKind, (u64, JoinHandle<()>)>,
}

impl DebounceTimers {
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Registers a timer, aborting the one it replaces.
    pub fn insert(&mut self, kind: CollectionKind, generation: u64, timer: JoinHandle<()>) {
        if let Some((_, previous)) = self.timers.insert(kind, (generation, timer)) {
            previous.abort();
        }
    }

    /// Drops the entry of a timer that fired, unless a newer timer has
    /// replaced it since.
    pub fn release(&mut self, kind: CollectionKind, generation: u64) -> bool {
        if self.timers.get(&kind).is_some_and(|(g, _)| *g == generation) {
            self.timers.remove(&kind);
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, kind: CollectionKind) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
    }
}
