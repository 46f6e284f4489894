//! In-process store backend
//!
//! All state sits behind one mutex. Each operation takes the lock once, does
//! its checks and writes, and releases it before returning, so conditional
//! updates are atomic and no lock is ever held across an `.await`. Room
//! sequence numbers are taken inside the same critical section as the write
//! they stamp.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use super::{MessageStore, PollStore, RoomStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    ClosedPoll, ClosedRoom, Committed, Message, MessageId, NewMessage, NewPoll, NewResource,
    NewRoom, Page, Participant, ParticipantStatus, Poll, PollId, Resource, Room, RoomFilter,
    RoomId, RoomUpdate, UserId,
};

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, Room>,
    /// Insertion order doubles as commit order
    messages: Vec<Message>,
    message_index: HashMap<MessageId, usize>,
    polls: HashMap<PollId, Poll>,
    seqs: HashMap<RoomId, u64>,
}

impl Inner {
    /// Claim the room's next sequence number. Call only once the write is certain.
    fn bump(&mut self, room_id: RoomId) -> u64 {
        let seq = self.seqs.entry(room_id).or_insert(0);
        *seq += 1;
        *seq
    }

    fn commit_room(&mut self, room: Room) -> Committed<Room> {
        let seq = self.bump(room.id);
        Committed::new(room, seq)
    }

    fn room_mut(&mut self, room_id: RoomId) -> StoreResult<&mut Room> {
        self.rooms.get_mut(&room_id).ok_or(StoreError::NotFound("Room"))
    }

    fn message(&self, message_id: MessageId) -> StoreResult<&Message> {
        self.message_index
            .get(&message_id)
            .and_then(|&i| self.messages.get(i))
            .ok_or(StoreError::NotFound("Message"))
    }

    fn message_mut(&mut self, message_id: MessageId) -> StoreResult<&mut Message> {
        let index = *self
            .message_index
            .get(&message_id)
            .ok_or(StoreError::NotFound("Message"))?;
        self.messages
            .get_mut(index)
            .ok_or(StoreError::NotFound("Message"))
    }

    fn push_message(&mut self, message: Message) {
        self.message_index.insert(message.id, self.messages.len());
        self.messages.push(message);
    }

    /// Clone a message, attaching its parent preview when it is a reply
    fn with_parent(&self, message: &Message) -> Message {
        let mut out = message.clone();
        out.parent = message
            .parent_id
            .and_then(|id| self.message(id).ok())
            .map(Message::preview);
        out
    }
}

/// Store backend that keeps everything in memory.
///
/// State is lost on restart; intended for tests and single-instance
/// development setups.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(
        &self,
        new: NewRoom,
        creator_id: UserId,
        creator_name: &str,
    ) -> StoreResult<Room> {
        let draft = new.into_draft()?;
        let now = OffsetDateTime::now_utc();

        let room = Room {
            id: RoomId::new(),
            name: draft.name,
            description: draft.description,
            unit_id: draft.unit_id,
            unit_code: draft.unit_code,
            faculty_code: draft.faculty_code,
            topic: draft.topic,
            current_focus: None,
            is_active: true,
            tags: draft.tags,
            created_by: creator_id,
            created_at: now,
            participants: vec![Participant {
                user_id: creator_id,
                display_name: creator_name.to_string(),
                status: ParticipantStatus::Active,
                joined_at: now,
            }],
            resources: Vec::new(),
        };

        self.lock()?.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: RoomId) -> StoreResult<Room> {
        self.lock()?
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(StoreError::NotFound("Room"))
    }

    async fn list_active_rooms(&self, filter: &RoomFilter, page: Page) -> StoreResult<Vec<Room>> {
        let inner = self.lock()?;
        let mut rooms: Vec<&Room> = inner
            .rooms
            .values()
            .filter(|r| r.is_active && filter.matches(r))
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rooms
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_rooms_for_participant(&self, user_id: UserId) -> StoreResult<Vec<Room>> {
        let inner = self.lock()?;
        let mut rooms: Vec<Room> = inner
            .rooms
            .values()
            .filter(|r| r.participant(&user_id).is_some())
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rooms)
    }

    async fn last_seq(&self, room_id: RoomId) -> StoreResult<u64> {
        let inner = self.lock()?;
        if !inner.rooms.contains_key(&room_id) {
            return Err(StoreError::NotFound("Room"));
        }
        Ok(inner.seqs.get(&room_id).copied().unwrap_or(0))
    }

    async fn add_or_update_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
        display_name: &str,
    ) -> StoreResult<Committed<Room>> {
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        if !room.is_active {
            return Err(StoreError::Inactive("Room"));
        }

        match room.participants.iter_mut().find(|p| p.user_id == user_id) {
            Some(existing) => {
                existing.status = ParticipantStatus::Active;
                existing.display_name = display_name.to_string();
            }
            None => room.participants.push(Participant {
                user_id,
                display_name: display_name.to_string(),
                status: ParticipantStatus::Active,
                joined_at: OffsetDateTime::now_utc(),
            }),
        }

        let room = room.clone();
        Ok(inner.commit_room(room))
    }

    async fn set_participant_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> StoreResult<Committed<Room>> {
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        let participant = room
            .participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(StoreError::NotFound("Participant"))?;
        participant.status = status;
        let room = room.clone();
        Ok(inner.commit_room(room))
    }

    async fn set_focus(&self, room_id: RoomId, topic: &str) -> StoreResult<Committed<Room>> {
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        if !room.is_active {
            return Err(StoreError::Inactive("Room"));
        }
        room.current_focus = Some(topic.trim().to_string()).filter(|t| !t.is_empty());
        let room = room.clone();
        Ok(inner.commit_room(room))
    }

    async fn add_resource(
        &self,
        room_id: RoomId,
        added_by: UserId,
        resource: NewResource,
    ) -> StoreResult<Committed<Resource>> {
        let resource = resource.into_resource(added_by)?;
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        if !room.is_active {
            return Err(StoreError::Inactive("Room"));
        }
        room.resources.push(resource.clone());
        let seq = inner.bump(room_id);
        Ok(Committed::new(resource, seq))
    }

    async fn update_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
        update: RoomUpdate,
    ) -> StoreResult<Committed<Room>> {
        update.validate()?;
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        if room.created_by != requested_by {
            return Err(StoreError::Forbidden(
                "Only the room creator can update the room".into(),
            ));
        }
        if !room.is_active {
            return Err(StoreError::Inactive("Room"));
        }
        update.apply(room);
        let room = room.clone();
        Ok(inner.commit_room(room))
    }

    async fn close_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
    ) -> StoreResult<Committed<ClosedRoom>> {
        let mut inner = self.lock()?;
        let room = inner.room_mut(room_id)?;
        if room.created_by != requested_by {
            return Err(StoreError::Forbidden(
                "Only the room creator can close the room".into(),
            ));
        }
        let transitioned = room.is_active;
        room.is_active = false;
        let closed = ClosedRoom {
            room: room.clone(),
            transitioned,
        };
        let seq = inner.bump(room_id);
        Ok(Committed::new(closed, seq))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn post_message(&self, new: NewMessage) -> StoreResult<Committed<Message>> {
        let content = new.checked_content()?;
        let mut inner = self.lock()?;
        if !inner.room_mut(new.room_id)?.is_active {
            return Err(StoreError::Inactive("Room"));
        }

        // Unknown or cross-room parents are flattened to top-level messages
        let parent_id = new.parent_id.filter(|id| {
            inner
                .message(*id)
                .is_ok_and(|parent| parent.room_id == new.room_id)
        });

        let message = Message {
            id: MessageId::new(),
            room_id: new.room_id,
            author_id: new.author_id,
            author_name: new.author_name,
            content,
            message_type: new.message_type,
            created_at: OffsetDateTime::now_utc(),
            like_count: 0,
            liked_by: Vec::new(),
            parent_id,
            parent: None,
            payload: new.payload,
        };

        let stored = inner.with_parent(&message);
        inner.push_message(message);
        let seq = inner.bump(stored.room_id);
        Ok(Committed::new(stored, seq))
    }

    async fn get_message(&self, message_id: MessageId) -> StoreResult<Message> {
        let inner = self.lock()?;
        let message = inner.message(message_id)?;
        Ok(inner.with_parent(message))
    }

    async fn list_recent(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .filter(|m| before.map_or(true, |cursor| m.created_at < cursor))
            .take(limit as usize)
            .map(|m| inner.with_parent(m))
            .collect())
    }

    async fn list_replies(&self, parent_id: MessageId) -> StoreResult<Vec<Message>> {
        let inner = self.lock()?;
        inner.message(parent_id)?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> StoreResult<Committed<Message>> {
        let mut inner = self.lock()?;
        let message = inner.message_mut(message_id)?;
        if message.is_liked_by(&user_id) {
            return Err(StoreError::AlreadyLiked);
        }
        message.liked_by.push(user_id);
        message.like_count += 1;
        let message = message.clone();
        let seq = inner.bump(message.room_id);
        Ok(Committed::new(inner.with_parent(&message), seq))
    }

    async fn unlike(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> StoreResult<Committed<Message>> {
        let mut inner = self.lock()?;
        let message = inner.message_mut(message_id)?;
        let Some(pos) = message.liked_by.iter().position(|u| *u == user_id) else {
            return Err(StoreError::NotLiked);
        };
        message.liked_by.remove(pos);
        message.like_count -= 1;
        let message = message.clone();
        let seq = inner.bump(message.room_id);
        Ok(Committed::new(inner.with_parent(&message), seq))
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn create_poll(&self, new: NewPoll) -> StoreResult<Committed<(Poll, Message)>> {
        let (poll, announcement) = new.into_records(OffsetDateTime::now_utc())?;
        let mut inner = self.lock()?;
        if !inner.room_mut(poll.room_id)?.is_active {
            return Err(StoreError::Inactive("Room"));
        }
        inner.push_message(announcement.clone());
        inner.polls.insert(poll.id, poll.clone());
        let seq = inner.bump(poll.room_id);
        Ok(Committed::new((poll, announcement), seq))
    }

    async fn get_poll(&self, poll_id: PollId) -> StoreResult<Poll> {
        self.lock()?
            .polls
            .get(&poll_id)
            .cloned()
            .ok_or(StoreError::NotFound("Poll"))
    }

    async fn cast_vote(
        &self,
        poll_id: PollId,
        option_index: usize,
        user_id: UserId,
    ) -> StoreResult<Committed<Poll>> {
        let mut inner = self.lock()?;
        let poll = inner
            .polls
            .get_mut(&poll_id)
            .ok_or(StoreError::NotFound("Poll"))?;

        if !poll.is_open_at(OffsetDateTime::now_utc()) {
            return Err(StoreError::Inactive("Poll"));
        }
        if option_index >= poll.options.len() {
            return Err(StoreError::InvalidArgument(format!(
                "Option index {option_index} is out of range"
            )));
        }
        if !poll.allow_multiple_votes && poll.has_voted(&user_id) {
            return Err(StoreError::AlreadyVoted);
        }

        let option = &mut poll.options[option_index];
        if option.voters.contains(&user_id) {
            return Err(StoreError::AlreadyVoted);
        }
        option.voters.push(user_id);
        option.vote_count += 1;
        poll.total_votes += 1;

        let poll = poll.clone();
        let seq = inner.bump(poll.room_id);
        Ok(Committed::new(poll, seq))
    }

    async fn close_poll(&self, poll_id: PollId) -> StoreResult<Committed<ClosedPoll>> {
        let mut inner = self.lock()?;
        let poll = inner
            .polls
            .get_mut(&poll_id)
            .ok_or(StoreError::NotFound("Poll"))?;
        let transitioned = poll.is_active;
        poll.is_active = false;
        let closed = ClosedPoll {
            poll: poll.clone(),
            transitioned,
        };
        let seq = inner.bump(closed.poll.room_id);
        Ok(Committed::new(closed, seq))
    }

    async fn get_active_polls(&self, room_id: RoomId) -> StoreResult<Vec<Poll>> {
        let inner = self.lock()?;
        let mut polls: Vec<Poll> = inner
            .polls
            .values()
            .filter(|p| p.room_id == room_id && p.is_active)
            .cloned()
            .collect();
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    async fn list_scheduled_polls(&self) -> StoreResult<Vec<Poll>> {
        let inner = self.lock()?;
        Ok(inner
            .polls
            .values()
            .filter(|p| p.is_active && p.expires_at.is_some())
            .cloned()
            .collect())
    }

    async fn list_expired_open_polls(&self, now: OffsetDateTime) -> StoreResult<Vec<Poll>> {
        let inner = self.lock()?;
        Ok(inner
            .polls
            .values()
            .filter(|p| p.is_active && p.expires_at.is_some_and(|deadline| deadline <= now))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn new_room() -> NewRoom {
        NewRoom {
            name: "Algorithms revision".into(),
            unit_id: Some(Uuid::new_v4()),
            unit_code: "COMP2123".into(),
            topic: "Graphs".into(),
            ..Default::default()
        }
    }

    fn new_poll(room_id: RoomId, creator: UserId, multiple: bool) -> NewPoll {
        NewPoll {
            room_id,
            created_by: creator,
            creator_name: "Ada".into(),
            question: "Topic A or B?".into(),
            options: vec!["A".into(), "B".into()],
            duration_minutes: None,
            allow_multiple_votes: multiple,
        }
    }

    async fn room_with_creator(store: &MemoryStore) -> (Room, UserId) {
        let creator = UserId::new();
        let room = store.create_room(new_room(), creator, "Ada").await.unwrap();
        (room, creator)
    }

    #[tokio::test]
    async fn test_create_room_adds_creator() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;

        assert!(room.is_active);
        assert_eq!(room.participants.len(), 1);
        assert_eq!(room.participants[0].user_id, creator);
        assert_eq!(room.participants[0].status, ParticipantStatus::Active);
    }

    #[tokio::test]
    async fn test_create_room_requires_fields() {
        let store = MemoryStore::new();
        let result = store
            .create_room(NewRoom::default(), UserId::new(), "Ada")
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let store = MemoryStore::new();
        let (room, _) = room_with_creator(&store).await;
        let user = UserId::new();

        store.add_or_update_participant(room.id, user, "Bob").await.unwrap();
        store
            .set_participant_status(room.id, user, ParticipantStatus::Away)
            .await
            .unwrap();
        let room = store
            .add_or_update_participant(room.id, user, "Bobby")
            .await
            .unwrap()
            .value;

        let entries: Vec<_> = room.participants.iter().filter(|p| p.user_id == user).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ParticipantStatus::Active);
        assert_eq!(entries[0].display_name, "Bobby");
        assert_eq!(room.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_room_rejects_join() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;

        let err = store.close_room(room.id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        store.close_room(room.id, creator).await.unwrap();
        let err = store
            .add_or_update_participant(room.id, UserId::new(), "Bob")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Inactive("Room")));

        let missing = store
            .add_or_update_participant(RoomId::new(), UserId::new(), "Bob")
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound("Room")));
    }

    #[tokio::test]
    async fn test_list_active_rooms_filters_and_orders() {
        let store = MemoryStore::new();
        let creator = UserId::new();
        let first = store.create_room(new_room(), creator, "Ada").await.unwrap();
        let second = store
            .create_room(
                NewRoom {
                    name: "Databases".into(),
                    topic: "Normal forms".into(),
                    unit_code: "INFO2222".into(),
                    unit_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
                creator,
                "Ada",
            )
            .await
            .unwrap();
        let closed = store.create_room(new_room(), creator, "Ada").await.unwrap();
        store.close_room(closed.id, creator).await.unwrap();

        let all = store
            .list_active_rooms(&RoomFilter::default(), Page::default())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&second.id));
        assert!(all[0].created_at >= all[1].created_at);

        let filter = RoomFilter {
            unit_id: None,
            search: Some("normal".into()),
        };
        let found = store.list_active_rooms(&filter, Page::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, second.id);

        let by_unit = RoomFilter {
            unit_id: Some(first.unit_id),
            search: None,
        };
        let found = store.list_active_rooms(&by_unit, Page::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, first.id);
    }

    #[tokio::test]
    async fn test_invalid_parent_is_flattened() {
        let store = MemoryStore::new();
        let (room, author) = room_with_creator(&store).await;
        let (other_room, _) = room_with_creator(&store).await;

        let foreign = store
            .post_message(NewMessage::text(other_room.id, author, "Ada", "elsewhere"))
            .await
            .unwrap()
            .value;

        let mut reply = NewMessage::text(room.id, author, "Ada", "reply");
        reply.parent_id = Some(foreign.id);
        let stored = store.post_message(reply).await.unwrap().value;
        assert_eq!(stored.parent_id, None);

        let mut reply = NewMessage::text(room.id, author, "Ada", "reply");
        reply.parent_id = Some(MessageId::new());
        let stored = store.post_message(reply).await.unwrap().value;
        assert_eq!(stored.parent_id, None);
    }

    #[tokio::test]
    async fn test_replies_and_previews() {
        let store = MemoryStore::new();
        let (room, author) = room_with_creator(&store).await;

        let parent = store
            .post_message(NewMessage::text(room.id, author, "Ada", "  question?  "))
            .await
            .unwrap()
            .value;
        assert_eq!(parent.content, "question?");

        let mut reply = NewMessage::text(room.id, author, "Ada", "answer");
        reply.parent_id = Some(parent.id);
        let reply = store.post_message(reply).await.unwrap().value;
        assert_eq!(reply.parent_id, Some(parent.id));
        assert_eq!(reply.parent.as_ref().unwrap().content, "question?");

        let recent = store.list_recent(room.id, 10, None).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, reply.id);
        assert_eq!(recent[0].parent.as_ref().unwrap().author_name, "Ada");

        let replies = store.list_replies(parent.id).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, reply.id);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let store = MemoryStore::new();
        let (room, author) = room_with_creator(&store).await;
        let result = store
            .post_message(NewMessage::text(room.id, author, "Ada", "   "))
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_list_recent_cursor() {
        let store = MemoryStore::new();
        let (room, author) = room_with_creator(&store).await;
        let first = store
            .post_message(NewMessage::text(room.id, author, "Ada", "one"))
            .await
            .unwrap()
            .value;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .post_message(NewMessage::text(room.id, author, "Ada", "two"))
            .await
            .unwrap()
            .value;

        let page = store.list_recent(room.id, 1, None).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.id);

        let older = store
            .list_recent(room.id, 10, Some(second.created_at))
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, first.id);
    }

    #[tokio::test]
    async fn test_like_unlike_count_consistency() {
        let store = MemoryStore::new();
        let (room, author) = room_with_creator(&store).await;
        let message = store
            .post_message(NewMessage::text(room.id, author, "Ada", "hello"))
            .await
            .unwrap()
            .value;
        let user = UserId::new();

        let liked = store.like(message.id, user).await.unwrap().value;
        assert_eq!(liked.like_count, 1);

        let again = store.like(message.id, user).await.unwrap_err();
        assert!(matches!(again, StoreError::AlreadyLiked));

        store.like(message.id, author).await.unwrap();
        let unliked = store.unlike(message.id, user).await.unwrap().value;
        assert_eq!(unliked.like_count, 1);
        assert_eq!(unliked.liked_by, vec![author]);

        let err = store.unlike(message.id, user).await.unwrap_err();
        assert!(matches!(err, StoreError::NotLiked));

        let current = store.get_message(message.id).await.unwrap();
        assert_eq!(current.like_count as usize, current.liked_by.len());
    }

    #[tokio::test]
    async fn test_create_poll_writes_announcement() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;

        let (poll, announcement) = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap()
            .value;
        assert_eq!(poll.message_id, Some(announcement.id));

        let stored = store.get_message(announcement.id).await.unwrap();
        assert_eq!(stored.message_type, crate::types::MessageType::Poll);

        let active = store.get_active_polls(room.id).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let (poll, _) = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap()
            .value;
        let voter = UserId::new();

        let poll = store.cast_vote(poll.id, 0, voter).await.unwrap().value;
        assert_eq!(poll.tally(), vec![1, 0]);
        assert_eq!(poll.total_votes, 1);

        let err = store.cast_vote(poll.id, 1, voter).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyVoted));

        let err = store.cast_vote(poll.id, 5, UserId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = store.cast_vote(PollId::new(), 0, voter).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("Poll")));
    }

    #[tokio::test]
    async fn test_multiple_votes_once_per_option() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let (poll, _) = store
            .create_poll(new_poll(room.id, creator, true))
            .await
            .unwrap()
            .value;
        let voter = UserId::new();

        store.cast_vote(poll.id, 0, voter).await.unwrap();
        let poll = store.cast_vote(poll.id, 1, voter).await.unwrap().value;
        assert_eq!(poll.total_votes, 2);

        let err = store.cast_vote(poll.id, 1, voter).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyVoted));
    }

    #[tokio::test]
    async fn test_concurrent_same_user_votes_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let (room, creator) = room_with_creator(&store).await;
        let (poll, _) = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap()
            .value;
        let voter = UserId::new();

        let poll_id = poll.id;
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.cast_vote(poll_id, i % 2, voter).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::AlreadyVoted) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.get_poll(poll.id).await.unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn test_concurrent_votes_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let (room, creator) = room_with_creator(&store).await;
        let (poll, _) = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap()
            .value;

        let poll_id = poll.id;
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.cast_vote(poll_id, i % 2, UserId::new()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let poll = store.get_poll(poll.id).await.unwrap();
        assert_eq!(poll.total_votes, 50);
        assert_eq!(poll.tally().iter().sum::<i64>(), poll.total_votes);
    }

    #[tokio::test]
    async fn test_close_poll_is_idempotent() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let (poll, _) = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap()
            .value;
        store.cast_vote(poll.id, 1, UserId::new()).await.unwrap();

        let first = store.close_poll(poll.id).await.unwrap().value;
        assert!(first.transitioned);
        assert!(!first.poll.is_active);

        let second = store.close_poll(poll.id).await.unwrap().value;
        assert!(!second.transitioned);
        assert_eq!(second.poll.tally(), first.poll.tally());

        let err = store.cast_vote(poll.id, 0, UserId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Inactive("Poll")));
        assert!(store.get_active_polls(room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_polls_listed_and_rejected() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let mut new = new_poll(room.id, creator, false);
        new.duration_minutes = Some(1);
        let (poll, _) = store.create_poll(new).await.unwrap().value;

        let now = OffsetDateTime::now_utc();
        assert!(store.list_expired_open_polls(now).await.unwrap().is_empty());
        assert_eq!(store.list_scheduled_polls().await.unwrap().len(), 1);

        let later = now + time::Duration::minutes(2);
        let expired = store.list_expired_open_polls(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, poll.id);
    }

    #[tokio::test]
    async fn test_closed_room_rejects_messages_and_polls() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let closed = store.close_room(room.id, creator).await.unwrap().value;
        assert!(closed.transitioned);

        let err = store
            .post_message(NewMessage::text(room.id, creator, "Ada", "still here?"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Inactive("Room")));

        let err = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Inactive("Room")));

        assert!(store.list_recent(room.id, 10, None).await.unwrap().is_empty());
        assert!(store.get_active_polls(room.id).await.unwrap().is_empty());

        let err = store
            .post_message(NewMessage::text(RoomId::new(), creator, "Ada", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("Room")));
    }

    #[tokio::test]
    async fn test_room_writes_take_consecutive_seqs() {
        let store = MemoryStore::new();
        let (room, creator) = room_with_creator(&store).await;
        let (other, _) = room_with_creator(&store).await;
        assert_eq!(store.last_seq(room.id).await.unwrap(), 0);

        let joined = store
            .add_or_update_participant(room.id, UserId::new(), "Bob")
            .await
            .unwrap();
        assert_eq!(joined.seq, 1);

        let message = store
            .post_message(NewMessage::text(room.id, creator, "Ada", "hello"))
            .await
            .unwrap();
        assert_eq!(message.seq, 2);

        // Other rooms count independently
        let elsewhere = store
            .post_message(NewMessage::text(other.id, creator, "Ada", "hi"))
            .await
            .unwrap();
        assert_eq!(elsewhere.seq, 1);

        // Rejected writes consume nothing
        store.like(message.value.id, creator).await.unwrap();
        store.like(message.value.id, creator).await.unwrap_err();
        let poll = store
            .create_poll(new_poll(room.id, creator, false))
            .await
            .unwrap();
        assert_eq!(poll.seq, 4);

        let vote = store.cast_vote(poll.value.0.id, 0, creator).await.unwrap();
        assert_eq!(vote.seq, 5);
        let closed = store.close_poll(poll.value.0.id).await.unwrap();
        assert_eq!(closed.seq, 6);
        let again = store.close_poll(poll.value.0.id).await.unwrap();
        assert!(!again.value.transitioned);
        assert_eq!(again.seq, 7);

        assert_eq!(store.last_seq(room.id).await.unwrap(), 7);
        assert!(matches!(
            store.last_seq(RoomId::new()).await,
            Err(StoreError::NotFound("Room"))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_get_unique_seqs() {
        let store = Arc::new(MemoryStore::new());
        let (room, creator) = room_with_creator(&store).await;
        let room_id = room.id;

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let text = format!("message {i}");
                store
                    .post_message(NewMessage::text(room_id, creator, "Ada", &text))
                    .await
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap().seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }
}
