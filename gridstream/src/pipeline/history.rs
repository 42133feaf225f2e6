//! Bounded memory of recently cancelled future ids.

use crate::core::FutureId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
struct Entries {
    order: VecDeque<FutureId>,
    ids: HashSet<FutureId>,
}

/// Remembers the last `capacity` cancelled future ids so that a cancel request
/// overtaking its execution request still takes effect.
#[derive(Debug)]
pub(crate) struct CancelledHistory {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl CancelledHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Records an id, forgetting the oldest one when full.
    pub(crate) fn insert(&self, id: FutureId) {
        let mut entries = self.entries.lock();
        if !entries.ids.insert(id) {
            return;
        }
        entries.order.push_back(id);
        while entries.order.len() > self.capacity {
            if let Some(old) = entries.order.pop_front() {
                entries.ids.remove(&old);
            }
        }
    }

    pub(crate) fn contains(&self, id: &FutureId) -> bool {
        self.entries.lock().ids.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;

    #[test]
    fn test_history_is_bounded() {
        let node = NodeId::new();
        let history = CancelledHistory::new(2);

        history.insert(FutureId::new(node, 1));
        history.insert(FutureId::new(node, 2));
        history.insert(FutureId::new(node, 2));
        assert_eq!(history.len(), 2);

        history.insert(FutureId::new(node, 3));

        assert_eq!(history.len(), 2);
        assert!(!history.contains(&FutureId::new(node, 1)));
        assert!(history.contains(&FutureId::new(node, 2)));
        assert!(history.contains(&FutureId::new(node, 3)));
    }
}
