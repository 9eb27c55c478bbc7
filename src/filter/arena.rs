//! Owning arena for pipeline filters.
//!
//! All filters of a pipeline live in one arena; graph edges are
//! [`FilterId`] index handles rather than shared-ownership pointers. An
//! invalid id simply fails lookup, and cycle checks are a cheap reachability
//! walk over indices.

use super::Filter;
use std::sync::{Arc, RwLock};

/// Handle to a filter slot in a [`FilterArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub(crate) usize);

impl FilterId {
    /// The underlying slot index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Owning container for a pipeline's filters.
pub struct FilterArena {
    slots: RwLock<Vec<Option<Arc<Filter>>>>,
}

impl FilterArena {
    /// Create an empty arena.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(Vec::new()),
        })
    }

    /// Insert a filter, returning its handle.
    pub fn insert(&self, filter: Arc<Filter>) -> FilterId {
        let mut slots = self.slots.write().unwrap();
        let id = FilterId(slots.len());
        filter.assign_id(id);
        slots.push(Some(filter));
        id
    }

    /// Look up a filter by handle.
    pub fn get(&self, id: FilterId) -> Option<Arc<Filter>> {
        self.slots.read().unwrap().get(id.0).and_then(|s| s.clone())
    }

    /// Remove a filter, leaving a tombstone so other handles stay valid.
    pub fn remove(&self, id: FilterId) -> Option<Arc<Filter>> {
        self.slots.write().unwrap().get_mut(id.0).and_then(|s| s.take())
    }

    /// Number of live filters.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// True if no live filters remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of all live filters, in insertion order.
    pub fn ids(&self) -> Vec<FilterId> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| FilterId(i)))
            .collect()
    }

    /// True if `target` is reachable from `from` through downstream edges.
    ///
    /// Used to reject links that would close a cycle.
    pub fn reaches(&self, from: FilterId, target: FilterId) -> bool {
        if from == target {
            return true;
        }
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(filter) = self.get(id) else { continue };
            for (_, next) in filter.downstream_ids() {
                if next == target {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }
}

impl std::fmt::Debug for FilterArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterArena").field("len", &self.len()).finish()
    }
}
