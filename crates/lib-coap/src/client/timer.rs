use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use tokio::time::Instant;

use crate::types::{ExchangeKey, MessageKey, TransactionKey};

/// What to do when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Retransmit a confirmable message, or give up on it.
    Retransmit(TransactionKey),

    /// An exchange made no progress within its window.
    ExchangeTimeout(ExchangeKey),

    /// Forget a duplicate-detection entry and its cached reply.
    DuplicateExpiry(MessageKey),
}

pub(crate) type TimerId = u64;

/// Deadline queue for all client timers. One priority heap plus lazy
/// cancellation keeps the driver at a single `sleep_until` regardless of how
/// many retransmissions, exchanges and dedup entries are pending.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    kinds: HashMap<TimerId, TimerKind>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn schedule(&mut self, at: Instant, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.heap.push(Reverse((at, id)));
        self.kinds.insert(id, kind);
        id
    }

    /// Cancelled timers stay in the heap and are skipped when they surface.
    pub fn cancel(&mut self, id: TimerId) {
        self.kinds.remove(&id);
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if self.kinds.contains_key(&id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next live timer that is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                return None;
            }
            self.heap.pop();

            if let Some(kind) = self.kinds.remove(&id) {
                return Some(kind);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(id: u16) -> TransactionKey {
        TransactionKey {
            endpoint: "127.0.0.1:5683".parse().unwrap(),
            message_id: id,
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        timers.schedule(now + Duration::from_secs(2), TimerKind::Retransmit(key(2)));
        timers.schedule(now + Duration::from_secs(1), TimerKind::Retransmit(key(1)));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(
            timers.pop_due(now + Duration::from_secs(3)),
            Some(TimerKind::Retransmit(key(1)))
        );
        assert_eq!(
            timers.pop_due(now + Duration::from_secs(3)),
            Some(TimerKind::Retransmit(key(2)))
        );
        assert_eq!(timers.pop_due(now + Duration::from_secs(3)), None);
    }

    #[test]
    fn not_due_yet() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        timers.schedule(now + Duration::from_secs(5), TimerKind::Retransmit(key(1)));
        assert_eq!(timers.pop_due(now), None);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        let id = timers.schedule(now, TimerKind::Retransmit(key(1)));
        timers.cancel(id);

        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.pop_due(now + Duration::from_secs(1)), None);
    }
}
