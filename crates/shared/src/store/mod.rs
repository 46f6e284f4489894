//! Store traits for rooms, messages and polls
//!
//! The authoritative room state lives behind these traits. Every method that
//! mutates state is a single atomic conditional update: callers never need a
//! read-check-write sequence to keep the invariants below.
//!
//! - one participant entry per (room, user)
//! - `like_count == liked_by.len()` and no duplicate likers
//! - `total_votes == sum(option.vote_count)`, at most one vote per user unless
//!   the poll allows multiple votes, and no votes once a poll is closed
//! - a closed room accepts no joins, messages, resources or polls
//!
//! Writes that are announced to a room return [`Committed`], stamped with the
//! room's next sequence number inside the same atomic update. A failed write
//! consumes no sequence number.
//!
//! Two backends are provided: [`PgStore`] for production and [`MemoryStore`]
//! for tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StoreResult;
use crate::types::{
    ClosedPoll, ClosedRoom, Committed, Message, MessageId, NewMessage, NewPoll, NewResource,
    NewRoom, Page, ParticipantStatus, Poll, PollId, Resource, Room, RoomFilter, RoomId,
    RoomUpdate, UserId,
};

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Create a room; the creator becomes its first, active participant.
    async fn create_room(
        &self,
        new: NewRoom,
        creator_id: UserId,
        creator_name: &str,
    ) -> StoreResult<Room>;

    async fn get_room(&self, room_id: RoomId) -> StoreResult<Room>;

    /// Active rooms only, newest first
    async fn list_active_rooms(&self, filter: &RoomFilter, page: Page) -> StoreResult<Vec<Room>>;

    async fn list_rooms_for_participant(&self, user_id: UserId) -> StoreResult<Vec<Room>>;

    /// Sequence number of the room's latest committed write (0 if none)
    async fn last_seq(&self, room_id: RoomId) -> StoreResult<u64>;

    /// Idempotent join. An existing entry is set back to active and gets the
    /// latest display name; otherwise a new entry is appended.
    async fn add_or_update_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
        display_name: &str,
    ) -> StoreResult<Committed<Room>>;

    async fn set_participant_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> StoreResult<Committed<Room>>;

    async fn set_focus(&self, room_id: RoomId, topic: &str) -> StoreResult<Committed<Room>>;

    async fn add_resource(
        &self,
        room_id: RoomId,
        added_by: UserId,
        resource: NewResource,
    ) -> StoreResult<Committed<Resource>>;

    /// Creator-only metadata update
    async fn update_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
        update: RoomUpdate,
    ) -> StoreResult<Committed<Room>>;

    /// Creator-only deactivation. Closing a closed room changes nothing but
    /// still takes a sequence number, with `transitioned` false.
    async fn close_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
    ) -> StoreResult<Committed<ClosedRoom>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message. A `parent_id` that does not name a message in the same
    /// room is dropped and the message is stored top-level. Fails with
    /// `Inactive` once the room is closed.
    async fn post_message(&self, new: NewMessage) -> StoreResult<Committed<Message>>;

    async fn get_message(&self, message_id: MessageId) -> StoreResult<Message>;

    /// Newest-first page, optionally strictly older than `before`.
    /// Replies carry a preview of their parent.
    async fn list_recent(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>>;

    /// Oldest-first replies to a message
    async fn list_replies(&self, parent_id: MessageId) -> StoreResult<Vec<Message>>;

    /// Fails with `AlreadyLiked` without touching the count if already liked
    async fn like(&self, message_id: MessageId, user_id: UserId)
        -> StoreResult<Committed<Message>>;

    /// Fails with `NotLiked` without touching the count if not liked
    async fn unlike(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> StoreResult<Committed<Message>>;
}

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Persist a poll together with its companion announcement message.
    /// Either both records are stored or neither is, under one sequence number.
    /// Fails with `Inactive` once the room is closed.
    async fn create_poll(&self, new: NewPoll) -> StoreResult<Committed<(Poll, Message)>>;

    async fn get_poll(&self, poll_id: PollId) -> StoreResult<Poll>;

    async fn cast_vote(
        &self,
        poll_id: PollId,
        option_index: usize,
        user_id: UserId,
    ) -> StoreResult<Committed<Poll>>;

    /// Idempotent close. `transitioned` reports whether this call closed it.
    async fn close_poll(&self, poll_id: PollId) -> StoreResult<Committed<ClosedPoll>>;

    async fn get_active_polls(&self, room_id: RoomId) -> StoreResult<Vec<Poll>>;

    /// Open polls with a deadline, used to re-arm timers on startup
    async fn list_scheduled_polls(&self) -> StoreResult<Vec<Poll>>;

    /// Open polls whose deadline is at or before `now`
    async fn list_expired_open_polls(&self, now: OffsetDateTime) -> StoreResult<Vec<Poll>>;
}
