//! Time-windowed delivery id de-duplication.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use domain::DeliveryId;

/// Recently accepted delivery ids, bounded by age and count.
///
/// A capacity of zero disables de-duplication.
#[derive(Debug)]
pub struct DeliveryWindow {
    ttl: Duration,
    capacity: usize,
    seen: HashMap<DeliveryId, Instant>,
    order: VecDeque<(DeliveryId, Instant)>,
}

impl DeliveryWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// A window that accepts every delivery.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Records `id` as accepted at `now`.
    ///
    /// Returns `false` when `id` was already accepted within the window.
    pub fn insert(&mut self, id: DeliveryId, now: Instant) -> bool {
        if self.capacity == 0 {
            return true;
        }
        self.expire(now);
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id.clone(), now);
        self.order.push_back((id, now));
        while self.seen.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    /// Forgets `id` so a redelivery is dispatched again.
    pub fn remove(&mut self, id: &DeliveryId) {
        if self.seen.remove(id).is_some() {
            self.order.retain(|(queued, _)| queued != id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((id, at)) = self.order.pop_front() {
            // Skip entries that were removed or re-inserted since.
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
            }
        }
    }
}

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;
