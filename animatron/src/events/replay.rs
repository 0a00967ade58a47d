//! Replay Buffer - bounded ring log of recently published events
//!
//! Observers that (re)connect ask for a snapshot, optionally since the last
//! sequence id they saw. If events they would need were already evicted the
//! buffer reports a gap instead of silently returning a partial history.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

use super::types::Event;

/// Default number of retained events
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// The requested cursor is older than the retained window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gap detected: events after {cursor} were evicted (oldest retained: {oldest:?})")]
pub struct ReplayGap {
    pub cursor: u64,
    pub oldest: Option<u64>,
}

/// Fixed-capacity FIFO of events ordered by sequence id
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<Event>,
    capacity: usize,
    /// Highest sequence id ever evicted (0 when nothing was evicted)
    evicted_through: u64,
}

impl ReplayBuffer {
    /// Create a buffer retaining at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "ReplayBuffer::new: called");
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            evicted_through: 0,
        }
    }

    /// Append an event, evicting the oldest one when full
    pub fn append(&mut self, event: Event) {
        debug_assert!(
            self.events.back().is_none_or(|last| last.sequence_id < event.sequence_id),
            "events must be appended in sequence order"
        );
        if self.events.len() == self.capacity
            && let Some(evicted) = self.events.pop_front()
        {
            self.evicted_through = evicted.sequence_id;
        }
        self.events.push_back(event);
    }

    /// Events newer than `since`, oldest first; the whole buffer when `since` is None
    pub fn snapshot(&self, since: Option<u64>) -> Result<Vec<Event>, ReplayGap> {
        let Some(cursor) = since else {
            return Ok(self.events.iter().cloned().collect());
        };

        if cursor < self.evicted_through {
            debug!(cursor, evicted_through = self.evicted_through, "ReplayBuffer::snapshot: gap");
            return Err(ReplayGap {
                cursor,
                oldest: self.oldest_sequence_id(),
            });
        }

        Ok(self
            .events
            .iter()
            .filter(|event| event.sequence_id > cursor)
            .cloned()
            .collect())
    }

    pub fn oldest_sequence_id(&self) -> Option<u64> {
        self.events.front().map(|e| e.sequence_id)
    }

    pub fn newest_sequence_id(&self) -> Option<u64> {
        self.events.back().map(|e| e.sequence_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{Payload, Topic};
    use chrono::Utc;
    use proptest::prelude::*;

    fn event(seq: u64) -> Event {
        Event {
            topic: Topic::new(if seq % 2 == 0 { "even" } else { "odd" }),
            payload: Payload::new(),
            source: "test".to_string(),
            timestamp: Utc::now(),
            sequence_id: seq,
        }
    }

    fn filled(capacity: usize, count: u64) -> ReplayBuffer {
        let mut buffer = ReplayBuffer::new(capacity);
        for seq in 1..=count {
            buffer.append(event(seq));
        }
        buffer
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.sequence_id).collect()
    }

    #[test]
    fn test_snapshot_after_overflow_keeps_newest_window() {
        let buffer = filled(100, 150);
        let snapshot = buffer.snapshot(None).unwrap();
        assert_eq!(ids(&snapshot), (51..=150).collect::<Vec<_>>());
        assert_eq!(buffer.oldest_sequence_id(), Some(51));
        assert_eq!(buffer.newest_sequence_id(), Some(150));
    }

    #[test]
    fn test_snapshot_with_evicted_cursor_reports_gap() {
        let buffer = filled(100, 150);
        let gap = buffer.snapshot(Some(10)).unwrap_err();
        assert_eq!(gap.cursor, 10);
        assert_eq!(gap.oldest, Some(51));
    }

    #[test]
    fn test_snapshot_at_eviction_boundary_is_complete() {
        let buffer = filled(100, 150);
        // 50 was the last evicted id, so everything after it is still retained
        let snapshot = buffer.snapshot(Some(50)).unwrap();
        assert_eq!(snapshot.len(), 100);
        assert!(buffer.snapshot(Some(49)).is_err());
    }

    #[test]
    fn test_snapshot_since_cursor_is_exclusive() {
        let buffer = filled(10, 5);
        assert_eq!(ids(&buffer.snapshot(Some(3)).unwrap()), vec![4, 5]);
    }

    #[test]
    fn test_snapshot_past_newest_is_empty() {
        let buffer = filled(10, 5);
        assert!(buffer.snapshot(Some(5)).unwrap().is_empty());
        assert!(buffer.snapshot(Some(99)).unwrap().is_empty());
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ReplayBuffer::default();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), DEFAULT_REPLAY_CAPACITY);
        assert!(buffer.snapshot(Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = filled(0, 3);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(ids(&buffer.snapshot(None).unwrap()), vec![3]);
    }

    proptest! {
        #[test]
        fn prop_buffer_retains_last_capacity_events(capacity in 1usize..64, count in 0u64..200) {
            let buffer = filled(capacity, count);
            let snapshot = buffer.snapshot(None).unwrap();
            let first = count.saturating_sub(capacity as u64) + 1;
            prop_assert_eq!(ids(&snapshot), (first..=count).collect::<Vec<_>>());
        }

        #[test]
        fn prop_cursor_either_gaps_or_returns_suffix(capacity in 1usize..64, count in 0u64..200, cursor in 0u64..220) {
            let buffer = filled(capacity, count);
            let evicted = count.saturating_sub(capacity as u64);
            match buffer.snapshot(Some(cursor)) {
                Ok(events) => {
                    prop_assert!(cursor >= evicted);
                    prop_assert_eq!(ids(&events), ((cursor + 1)..=count).collect::<Vec<_>>());
                }
                Err(gap) => {
                    prop_assert!(cursor < evicted);
                    prop_assert_eq!(gap.oldest, Some(evicted + 1));
                }
            }
        }
    }
}
