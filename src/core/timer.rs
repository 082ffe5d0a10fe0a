//! Sorted-deadline timer queue.
//!
//! Scenes sweep this once per tick, so resolution is bounded by the tick
//! interval. Ordering among equal deadlines follows scheduling order.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Deadline-ordered queue of pending items.
#[derive(Debug)]
pub struct TimerWheel<T> {
    entries: BTreeMap<(Instant, TimerId), T>,
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `item` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, item: T) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert((deadline, id), item);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Remove a timer before it fires.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    /// Remove and return every item due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), item) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push(item);
        }
        due
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pending timer count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let base = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(base + Duration::from_millis(30), "c");
        wheel.schedule(base + Duration::from_millis(10), "a");
        wheel.schedule(base + Duration::from_millis(20), "b");

        assert_eq!(wheel.pop_due(base + Duration::from_millis(25)), vec!["a", "b"]);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(base + Duration::from_millis(30)));
    }

    #[test]
    fn test_cancel() {
        let base = Instant::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.schedule(base, 1);
        wheel.schedule(base, 2);

        assert_eq!(wheel.cancel(id), Some(1));
        assert_eq!(wheel.cancel(id), None);
        assert_eq!(wheel.pop_due(base), vec![2]);
        assert!(wheel.is_empty());
    }
}
