// ABOUTME: Strict id-ordered delivery buffer for the notify listener
// ABOUTME: Reorders out-of-order arrivals and drops notification replays

use std::collections::BTreeMap;

/// Reorders an unordered event stream into strictly increasing id order.
///
/// Notifications can replay ids the backfill already drained, and a buffered
/// notification can arrive before its predecessor. The queue tracks the last
/// emitted id and holds early arrivals until the gap closes, so the
/// downstream sees every id exactly once, ascending, with no gaps.
#[derive(Debug, Default)]
pub struct OrderedQueue<T> {
    last_emitted: Option<i64>,
    pending: BTreeMap<i64, T>,
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        OrderedQueue {
            last_emitted: None,
            pending: BTreeMap::new(),
        }
    }

    /// Offer an event with its id; returns the events now ready to emit, in
    /// order. An empty result means the event was buffered or was a
    /// duplicate.
    pub fn push(&mut self, id: i64, event: T) -> Vec<T> {
        let last = match self.last_emitted {
            None => {
                // First event establishes the cursor.
                self.last_emitted = Some(id);
                return vec![event];
            }
            Some(last) => last,
        };

        if id <= last {
            tracing::debug!("skipping duplicate record id: {}", id);
            return Vec::new();
        }

        if id != last + 1 {
            tracing::debug!("buffering out-of-order record id: {}", id);
            self.pending.insert(id, event);
            return Vec::new();
        }

        let mut ready = vec![event];
        let mut next = id + 1;
        while let Some(buffered) = self.pending.remove(&next) {
            ready.push(buffered);
            next += 1;
        }
        self.last_emitted = Some(next - 1);
        ready
    }

    /// The id of the most recently emitted event.
    pub fn last_emitted(&self) -> Option<i64> {
        self.last_emitted
    }

    /// Number of buffered out-of-order events.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
