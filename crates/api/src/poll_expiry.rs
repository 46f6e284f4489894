//! Timed poll closure
//!
//! Each poll with a deadline gets one in-process timer. Timers are lost on
//! restart, so a periodic sweep closes any open poll whose deadline has
//! already passed. Closing is idempotent in the store and `poll_closed` is
//! only broadcast by the caller that actually closed the poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revroom_shared::{PollId, PollStore, RoomId, RoomStore};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::error::ApiResult;
use crate::websocket::{Fanout, PresenceManager, ServerEvent};

struct Timer {
    /// Tells a finished timer apart from the one that replaced it
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PollScheduler {
    rooms: Arc<dyn RoomStore>,
    polls: Arc<dyn PollStore>,
    presence: PresenceManager,
    timers: Arc<Mutex<HashMap<PollId, Timer>>>,
    generations: Arc<AtomicU64>,
}

impl PollScheduler {
    pub fn new(
        rooms: Arc<dyn RoomStore>,
        polls: Arc<dyn PollStore>,
        presence: PresenceManager,
    ) -> Self {
        Self {
            rooms,
            polls,
            presence,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arm a timer that closes the poll at `expires_at`. Replaces any timer
    /// already armed for the same poll.
    pub fn schedule(&self, poll_id: PollId, expires_at: OffsetDateTime) {
        let delay = Duration::try_from(expires_at - OffsetDateTime::now_utc()).unwrap_or_default();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        // The table stays locked until the timer is registered, so even a
        // zero delay cannot finish and forget itself first
        let Ok(mut timers) = self.timers.lock() else {
            tracing::error!(poll_id = %poll_id, "Poll timer table poisoned");
            return;
        };

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.expire(poll_id).await {
                tracing::error!(poll_id = %poll_id, error = %e, "Timed poll close failed");
            }
            scheduler.forget(poll_id, generation);
        });

        if let Some(previous) = timers.insert(poll_id, Timer { generation, handle }) {
            previous.handle.abort();
        }

        tracing::debug!(
            poll_id = %poll_id,
            delay_secs = delay.as_secs(),
            "Armed poll expiry timer"
        );
    }

    /// Drop the timer for a poll closed by other means
    pub fn cancel(&self, poll_id: PollId) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(timer) = timers.remove(&poll_id) {
                timer.handle.abort();
            }
        }
    }

    /// Drop a finished timer's entry unless it has been replaced since
    fn forget(&self, poll_id: PollId, generation: u64) {
        if let Ok(mut timers) = self.timers.lock() {
            if timers.get(&poll_id).is_some_and(|t| t.generation == generation) {
                timers.remove(&poll_id);
            }
        }
    }

    async fn prime(&self, room_id: RoomId) -> ApiResult<()> {
        if !self.presence.is_primed(&room_id).await {
            let last_seq = self.rooms.last_seq(room_id).await?;
            self.presence.prime(room_id, last_seq).await;
        }
        Ok(())
    }

    /// Close a poll whose deadline has passed. Returns whether this call
    /// closed it.
    pub async fn expire(&self, poll_id: PollId) -> ApiResult<bool> {
        let room_id = self.polls.get_poll(poll_id).await?.room_id;
        self.prime(room_id).await?;

        let committed = self.polls.close_poll(poll_id).await?;
        let closed = committed.value;
        let batch = if closed.transitioned {
            vec![Fanout::all(ServerEvent::PollClosed {
                room_id,
                poll: closed.poll.clone(),
            })]
        } else {
            Vec::new()
        };
        self.presence.publish(room_id, committed.seq, batch).await;

        if closed.transitioned {
            tracing::info!(
                poll_id = %poll_id,
                room_id = %room_id,
                total_votes = closed.poll.total_votes,
                "Poll expired"
            );
        }
        Ok(closed.transitioned)
    }

    /// Close every open poll whose deadline is at or before `now`
    pub async fn sweep(&self, now: OffsetDateTime) -> ApiResult<usize> {
        let expired = self.polls.list_expired_open_polls(now).await?;
        let mut closed = 0;
        for poll in expired {
            self.cancel(poll.id);
            match self.expire(poll.id).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(poll_id = %poll.id, error = %e, "Sweep failed to close poll")
                }
            }
        }
        if closed > 0 {
            tracing::info!(closed, "Poll expiry sweep closed overdue polls");
        }
        Ok(closed)
    }

    /// Re-arm timers for open polls after a restart
    pub async fn rearm(&self) -> ApiResult<usize> {
        let now = OffsetDateTime::now_utc();
        self.sweep(now).await?;

        let scheduled = self.polls.list_scheduled_polls().await?;
        let mut armed = 0;
        for poll in scheduled {
            if let Some(expires_at) = poll.expires_at {
                self.schedule(poll.id, expires_at);
                armed += 1;
            }
        }
        tracing::info!(armed, "Re-armed poll expiry timers");
        Ok(armed)
    }

    /// Run the recovery sweep forever at a fixed interval
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.sweep(OffsetDateTime::now_utc()).await {
                    tracing::error!(error = %e, "Poll expiry sweep failed");
                }
            }
        })
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Abort every outstanding timer. Deadlines are persisted, so the next
    /// start picks them up again.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, timer) in timers.drain() {
                timer.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revroom_shared::{MemoryStore, NewPoll, NewRoom, RoomStore, UserId};
    use uuid::Uuid;

    async fn setup() -> (Arc<MemoryStore>, PresenceManager, PollScheduler, NewPoll) {
        let store = Arc::new(MemoryStore::new());
        let presence = PresenceManager::new(16);
        let scheduler = PollScheduler::new(store.clone(), store.clone(), presence.clone());

        let creator = UserId::new();
        let room = store
            .create_room(
                NewRoom {
                    name: "Algebra".into(),
                    unit_id: Some(Uuid::new_v4()),
                    unit_code: "MATH101".into(),
                    topic: "Groups".into(),
                    ..Default::default()
                },
                creator,
                "Ada",
            )
            .await
            .unwrap();

        let new_poll = NewPoll {
            room_id: room.id,
            created_by: creator,
            creator_name: "Ada".into(),
            question: "A or B?".into(),
            options: vec!["A".into(), "B".into()],
            duration_minutes: Some(1),
            allow_multiple_votes: false,
        };
        (store, presence, scheduler, new_poll)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_closes_poll_and_broadcasts_once() {
        let (store, presence, scheduler, new_poll) = setup().await;
        let room_id = new_poll.room_id;
        let (conn, mut rx) = presence.attach_identity(UserId::new(), "Bo".into()).await;
        presence.subscribe(&conn, room_id).await;

        let (poll, _) = store.create_poll(new_poll).await.unwrap().value;
        scheduler.schedule(poll.id, poll.expires_at.unwrap());
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;

        match rx.try_recv() {
            Ok(ServerEvent::PollClosed { poll: closed, .. }) => {
                assert_eq!(closed.id, poll.id);
                assert!(!closed.is_active);
            }
            other => panic!("Expected PollClosed, got {other:?}"),
        }
        assert_eq!(scheduler.pending(), 0);

        // A later sweep sees nothing left to close
        let swept = scheduler
            .sweep(OffsetDateTime::now_utc() + time::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(swept, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_closes_overdue_polls() {
        let (store, _presence, scheduler, new_poll) = setup().await;
        let (poll, _) = store.create_poll(new_poll).await.unwrap().value;

        let before_deadline = scheduler.sweep(OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(before_deadline, 0);

        let after_deadline = OffsetDateTime::now_utc() + time::Duration::minutes(2);
        assert_eq!(scheduler.sweep(after_deadline).await.unwrap(), 1);
        assert!(!store.get_poll(poll.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_expire_after_manual_close_does_not_transition() {
        let (store, _presence, scheduler, new_poll) = setup().await;
        let (poll, _) = store.create_poll(new_poll).await.unwrap().value;

        store.close_poll(poll.id).await.unwrap();
        assert!(!scheduler.expire(poll.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_timer() {
        let (store, _presence, scheduler, new_poll) = setup().await;
        let (poll, _) = store.create_poll(new_poll).await.unwrap().value;
        let deadline = poll.expires_at.unwrap();

        scheduler.schedule(poll.id, deadline);
        scheduler.schedule(poll.id, deadline);
        assert_eq!(scheduler.pending(), 1);

        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_replaced_timer_cannot_forget_its_successor() {
        let (store, _presence, scheduler, new_poll) = setup().await;
        let (poll, _) = store.create_poll(new_poll).await.unwrap().value;
        let deadline = poll.expires_at.unwrap();
        let generation = |s: &PollScheduler| s.timers.lock().unwrap()[&poll.id].generation;

        scheduler.schedule(poll.id, deadline);
        let first = generation(&scheduler);
        scheduler.schedule(poll.id, deadline);
        let second = generation(&scheduler);
        assert_ne!(first, second);

        scheduler.forget(poll.id, first);
        assert_eq!(scheduler.pending(), 1);

        scheduler.forget(poll.id, second);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overdue_timers_leave_no_entries() {
        let (store, _presence, scheduler, new_poll) = setup().await;
        let mut ids = Vec::new();
        for _ in 0..20 {
            let (poll, _) = store.create_poll(new_poll.clone()).await.unwrap().value;
            // Deadline already passed, so each timer fires straight away
            scheduler.schedule(poll.id, OffsetDateTime::now_utc() - time::Duration::seconds(1));
            ids.push(poll.id);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timers should clear their own entries");

        for id in ids {
            assert!(!store.get_poll(id).await.unwrap().is_active);
        }
    }
}
