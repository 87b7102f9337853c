use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Key a caregiver notification is deduplicated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub caregiver_id: Uuid,
    pub occurrence_id: Uuid,
}

/// Bounded memory of recently raised notifications.
///
/// Oldest keys are evicted first once `capacity` is reached. The event log's
/// unique index remains the durable guard; this only saves the round trip.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<NotificationKey>,
    seen: HashSet<NotificationKey>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, key: &NotificationKey) -> bool {
        self.seen.contains(key)
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: NotificationKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
