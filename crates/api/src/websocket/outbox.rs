//! Per-room release queue
//!
//! Store writes in a room are numbered in commit order, but the handlers that
//! made them reach the broadcaster in whatever order the scheduler picks. A
//! [`RoomOutbox`] holds a batch back until every earlier number has been
//! released, so subscribers see events in commit order.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::events::ServerEvent;

/// One event for a room's subscribers
#[derive(Debug, Clone)]
pub struct Fanout {
    pub event: ServerEvent,
    /// Session left out, usually the one that caused the event
    pub except: Option<Uuid>,
}

impl Fanout {
    pub fn all(event: ServerEvent) -> Self {
        Self {
            event,
            except: None,
        }
    }

    pub fn except(session_id: Uuid, event: ServerEvent) -> Self {
        Self {
            event,
            except: Some(session_id),
        }
    }
}

#[derive(Debug)]
pub struct RoomOutbox {
    /// Next sequence number to release
    next: u64,
    pending: BTreeMap<u64, Vec<Fanout>>,
    /// Missing number a gap timer is already armed for
    watching: Option<u64>,
}

impl RoomOutbox {
    pub fn new(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
            watching: None,
        }
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    /// Queue the batch committed as `seq` and return everything that is now
    /// releasable, oldest first. Numbers already passed are released at once.
    pub fn accept(&mut self, seq: u64, batch: Vec<Fanout>) -> Vec<Fanout> {
        if seq < self.next {
            return batch;
        }
        self.pending.insert(seq, batch);
        self.drain()
    }

    /// The number holding the queue back, if anything is waiting on it
    pub fn waiting_on(&self) -> Option<u64> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.next)
        }
    }

    /// Like [`waiting_on`](Self::waiting_on), but only once per missing
    /// number, so a single timer covers each gap.
    pub fn needs_watch(&mut self) -> Option<u64> {
        let missing = self.waiting_on()?;
        if self.watching == Some(missing) {
            return None;
        }
        self.watching = Some(missing);
        Some(missing)
    }

    /// Stop waiting for `missing` and release what queued up behind it.
    /// Does nothing if the gap has closed in the meantime.
    pub fn skip(&mut self, missing: u64) -> Vec<Fanout> {
        if self.next != missing {
            return Vec::new();
        }
        match self.pending.keys().next() {
            Some(&first) => self.next = first,
            None => return Vec::new(),
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<Fanout> {
        let mut ready = Vec::new();
        while let Some(batch) = self.pending.remove(&self.next) {
            ready.extend(batch);
            self.next += 1;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pongs(n: usize) -> Vec<Fanout> {
        (0..n).map(|_| Fanout::all(ServerEvent::Pong)).collect()
    }

    #[test]
    fn test_in_order_batches_pass_straight_through() {
        let mut outbox = RoomOutbox::new(1);
        assert_eq!(outbox.accept(1, pongs(2)).len(), 2);
        assert_eq!(outbox.accept(2, Vec::new()).len(), 0);
        assert_eq!(outbox.accept(3, pongs(1)).len(), 1);
        assert_eq!(outbox.next(), 4);
        assert_eq!(outbox.waiting_on(), None);
    }

    #[test]
    fn test_early_batch_waits_for_its_predecessor() {
        let mut outbox = RoomOutbox::new(1);
        assert!(outbox.accept(2, pongs(1)).is_empty());
        assert!(outbox.accept(3, pongs(1)).is_empty());
        assert_eq!(outbox.waiting_on(), Some(1));

        // The empty batch for 1 still unblocks 2 and 3
        assert_eq!(outbox.accept(1, Vec::new()).len(), 2);
        assert_eq!(outbox.next(), 4);
    }

    #[test]
    fn test_passed_numbers_release_immediately() {
        let mut outbox = RoomOutbox::new(10);
        assert_eq!(outbox.accept(4, pongs(1)).len(), 1);
        assert_eq!(outbox.next(), 10);
    }

    #[test]
    fn test_skip_releases_past_a_lost_number() {
        let mut outbox = RoomOutbox::new(1);
        outbox.accept(2, pongs(1));
        outbox.accept(4, pongs(1));

        assert_eq!(outbox.needs_watch(), Some(1));
        assert_eq!(outbox.needs_watch(), None);

        // A stale timer is ignored
        assert!(outbox.skip(7).is_empty());

        assert_eq!(outbox.skip(1).len(), 1);
        assert_eq!(outbox.next(), 3);
        assert_eq!(outbox.needs_watch(), Some(3));

        assert_eq!(outbox.skip(3).len(), 1);
        assert_eq!(outbox.next(), 5);
        assert_eq!(outbox.waiting_on(), None);
    }
}
