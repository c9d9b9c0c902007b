//! Bounded set of recently applied patch ids.
//!
//! Delivery is at-least-once, so the same patch can arrive twice (once live,
//! once from a peer's queue replay). The coordinator records every applied
//! id here and drops repeats.
//!
//! The set holds at most `capacity` ids and forgets the oldest first. An id
//! that has been evicted is no longer recognized; a repeat of that patch is
//! applied again and relies on operation semantics (`replace` and `remove`
//! settle to the same state, array `add` does not).

use patchsync_types::PatchId;
use std::collections::{HashSet, VecDeque};

/// Default number of ids remembered.
pub const DEFAULT_CAPACITY: usize = 1024;

/// FIFO-bounded set of patch ids.
#[derive(Debug, Clone)]
pub struct SeenPatches {
    /// Maximum number of ids remembered.
    capacity: usize,
    /// Insertion order, oldest at the front.
    order: VecDeque<PatchId>,
    /// Membership index.
    ids: HashSet<PatchId>,
}

impl SeenPatches {
    /// Create a set remembering at most `capacity` ids (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `true` if it had not been seen.
    pub fn insert(&mut self, id: PatchId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Whether `id` is currently remembered.
    pub fn contains(&self, id: &PatchId) -> bool {
        self.ids.contains(id)
    }

    /// Number of ids remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of ids remembered.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

impl Default for SeenPatches {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
