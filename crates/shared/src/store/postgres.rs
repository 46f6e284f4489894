//! Postgres store backend
//!
//! Every write that is announced to a room runs in a transaction that starts
//! by bumping the room's `event_seq`. That update row-locks the room, so
//! writers in one room queue behind each other instead of racing a
//! read-check-write, and the sequence number they get is their commit order.
//! A rolled-back write hands its number back. The room row is always locked
//! before any message or poll row.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{MessageStore, PollStore, RoomStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    ClosedPoll, ClosedRoom, Committed, Message, MessageId, NewMessage, NewPoll, NewResource,
    NewRoom, Page, ParentPreview, Participant, ParticipantStatus, Poll, PollId, PollOption,
    Resource, Room, RoomFilter, RoomId, RoomUpdate, UserId,
};

const ROOM_COLUMNS: &str = "id, name, description, unit_id, unit_code, faculty_code, topic, \
     current_focus, is_active, tags, created_by, created_at";

const MESSAGE_SELECT: &str = r#"
    SELECT m.id, m.room_id, m.author_id, m.author_name, m.content, m.message_type,
           m.parent_id, m.payload, m.like_count, m.created_at,
           COALESCE(
             (SELECT array_agg(l.user_id ORDER BY l.created_at)
              FROM message_likes l WHERE l.message_id = m.id),
             '{}'
           ) AS liked_by,
           p.author_name AS parent_author,
           p.content AS parent_content
    FROM room_messages m
    LEFT JOIN room_messages p ON p.id = m.parent_id
"#;

const POLL_COLUMNS: &str = "id, room_id, message_id, question, created_by, created_at, \
     expires_at, is_active, allow_multiple_votes, total_votes";

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct RoomRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    unit_id: Uuid,
    unit_code: String,
    faculty_code: Option<String>,
    topic: String,
    current_focus: Option<String>,
    is_active: bool,
    tags: Vec<String>,
    created_by: Uuid,
    created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct ParticipantRow {
    room_id: Uuid,
    user_id: Uuid,
    display_name: String,
    status: String,
    joined_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct ResourceRow {
    id: Uuid,
    room_id: Uuid,
    resource_type: String,
    reference_id: Option<String>,
    title: String,
    url: Option<String>,
    added_by: Uuid,
    added_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    room_id: Uuid,
    author_id: Uuid,
    author_name: String,
    content: String,
    message_type: String,
    parent_id: Option<Uuid>,
    payload: Option<serde_json::Value>,
    like_count: i64,
    created_at: OffsetDateTime,
    liked_by: Vec<Uuid>,
    parent_author: Option<String>,
    parent_content: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let parent = match (row.parent_id, row.parent_author, row.parent_content) {
            (Some(id), Some(author_name), Some(content)) => Some(ParentPreview {
                id: MessageId(id),
                author_name,
                content,
            }),
            _ => None,
        };

        Ok(Message {
            id: MessageId(row.id),
            room_id: RoomId(row.room_id),
            author_id: UserId(row.author_id),
            author_name: row.author_name,
            content: row.content,
            message_type: row.message_type.parse()?,
            created_at: row.created_at,
            like_count: row.like_count,
            liked_by: row.liked_by.into_iter().map(UserId).collect(),
            parent_id: row.parent_id.map(MessageId),
            parent,
            payload: row.payload,
        })
    }
}

#[derive(Debug, FromRow)]
struct PollRow {
    id: Uuid,
    room_id: Uuid,
    message_id: Option<Uuid>,
    question: String,
    created_by: Uuid,
    created_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    is_active: bool,
    allow_multiple_votes: bool,
    total_votes: i64,
}

#[derive(Debug, FromRow)]
struct PollOptionRow {
    poll_id: Uuid,
    text: String,
    vote_count: i64,
    voters: Vec<Uuid>,
}

#[derive(Debug, FromRow)]
struct VoteGuardRow {
    is_active: bool,
    expired: bool,
    allow_multiple_votes: bool,
}

// =============================================================================
// Store
// =============================================================================

/// Store backend over a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Attach participants and resources to room rows, keeping row order
async fn hydrate_rooms(conn: &mut PgConnection, rows: Vec<RoomRow>) -> StoreResult<Vec<Room>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

    let participant_rows: Vec<ParticipantRow> = sqlx::query_as(
        r#"
        SELECT room_id, user_id, display_name, status, joined_at
        FROM room_participants
        WHERE room_id = ANY($1)
        ORDER BY joined_at ASC, user_id ASC
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let resource_rows: Vec<ResourceRow> = sqlx::query_as(
        r#"
        SELECT id, room_id, resource_type, reference_id, title, url, added_by, added_at
        FROM room_resources
        WHERE room_id = ANY($1)
        ORDER BY added_at ASC
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut participants: HashMap<Uuid, Vec<Participant>> = HashMap::new();
    for row in participant_rows {
        participants.entry(row.room_id).or_default().push(Participant {
            user_id: UserId(row.user_id),
            display_name: row.display_name,
            status: row.status.parse()?,
            joined_at: row.joined_at,
        });
    }

    let mut resources: HashMap<Uuid, Vec<Resource>> = HashMap::new();
    for row in resource_rows {
        resources.entry(row.room_id).or_default().push(Resource {
            id: row.id,
            resource_type: row.resource_type.parse()?,
            reference_id: row.reference_id,
            title: row.title,
            url: row.url,
            added_by: UserId(row.added_by),
            added_at: row.added_at,
        });
    }

    Ok(rows
        .into_iter()
        .map(|row| Room {
            id: RoomId(row.id),
            name: row.name,
            description: row.description,
            unit_id: row.unit_id,
            unit_code: row.unit_code,
            faculty_code: row.faculty_code,
            topic: row.topic,
            current_focus: row.current_focus,
            is_active: row.is_active,
            tags: row.tags,
            created_by: UserId(row.created_by),
            created_at: row.created_at,
            participants: participants.remove(&row.id).unwrap_or_default(),
            resources: resources.remove(&row.id).unwrap_or_default(),
        })
        .collect())
}

async fn load_room(conn: &mut PgConnection, room_id: RoomId) -> StoreResult<Room> {
    let row: Option<RoomRow> = sqlx::query_as(&format!(
        "SELECT {ROOM_COLUMNS} FROM revision_rooms WHERE id = $1"
    ))
    .bind(room_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let row = row.ok_or(StoreError::NotFound("Room"))?;
    hydrate_rooms(conn, vec![row])
        .await?
        .pop()
        .ok_or(StoreError::NotFound("Room"))
}

/// Room row state seen by a write after claiming its sequence number
struct RoomClaim {
    owner: UserId,
    is_active: bool,
    seq: u64,
}

impl RoomClaim {
    fn require_active(&self) -> StoreResult<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(StoreError::Inactive("Room"))
        }
    }
}

/// Take the room's next sequence number, holding the room row lock until
/// the transaction ends.
async fn claim_seq(conn: &mut PgConnection, room_id: RoomId) -> StoreResult<RoomClaim> {
    let row: Option<(Uuid, bool, i64)> = sqlx::query_as(
        r#"
        UPDATE revision_rooms SET event_seq = event_seq + 1
        WHERE id = $1
        RETURNING created_by, is_active, event_seq
        "#,
    )
    .bind(room_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let (owner, is_active, seq) = row.ok_or(StoreError::NotFound("Room"))?;
    Ok(RoomClaim {
        owner: UserId(owner),
        is_active,
        seq: seq.max(0) as u64,
    })
}

async fn message_room(pool: &PgPool, message_id: MessageId) -> StoreResult<RoomId> {
    let room_id: Option<Uuid> = sqlx::query_scalar("SELECT room_id FROM room_messages WHERE id = $1")
        .bind(message_id.0)
        .fetch_optional(pool)
        .await?;
    room_id.map(RoomId).ok_or(StoreError::NotFound("Message"))
}

async fn poll_room(pool: &PgPool, poll_id: PollId) -> StoreResult<RoomId> {
    let room_id: Option<Uuid> = sqlx::query_scalar("SELECT room_id FROM room_polls WHERE id = $1")
        .bind(poll_id.0)
        .fetch_optional(pool)
        .await?;
    room_id.map(RoomId).ok_or(StoreError::NotFound("Poll"))
}

async fn load_message(conn: &mut PgConnection, message_id: MessageId) -> StoreResult<Message> {
    let row: Option<MessageRow> = sqlx::query_as(&format!("{MESSAGE_SELECT} WHERE m.id = $1"))
        .bind(message_id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or(StoreError::NotFound("Message"))?.try_into()
}

async fn insert_message(conn: &mut PgConnection, message: &Message) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO room_messages
            (id, room_id, author_id, author_name, content, message_type, parent_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(message.id.0)
    .bind(message.room_id.0)
    .bind(message.author_id.0)
    .bind(&message.author_name)
    .bind(&message.content)
    .bind(message.message_type.as_str())
    .bind(message.parent_id.map(|id| id.0))
    .bind(&message.payload)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Attach options and voter sets to poll rows, keeping row order
async fn hydrate_polls(conn: &mut PgConnection, rows: Vec<PollRow>) -> StoreResult<Vec<Poll>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

    let option_rows: Vec<PollOptionRow> = sqlx::query_as(
        r#"
        SELECT o.poll_id, o.text, o.vote_count,
               COALESCE(
                 (SELECT array_agg(v.user_id ORDER BY v.created_at)
                  FROM poll_votes v
                  WHERE v.poll_id = o.poll_id AND v.option_index = o.option_index),
                 '{}'
               ) AS voters
        FROM poll_options o
        WHERE o.poll_id = ANY($1)
        ORDER BY o.poll_id, o.option_index
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut options: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
    for row in option_rows {
        options.entry(row.poll_id).or_default().push(PollOption {
            text: row.text,
            vote_count: row.vote_count,
            voters: row.voters.into_iter().map(UserId).collect(),
        });
    }

    Ok(rows
        .into_iter()
        .map(|row| Poll {
            id: PollId(row.id),
            room_id: RoomId(row.room_id),
            message_id: row.message_id.map(MessageId),
            question: row.question,
            options: options.remove(&row.id).unwrap_or_default(),
            created_by: UserId(row.created_by),
            created_at: row.created_at,
            expires_at: row.expires_at,
            is_active: row.is_active,
            allow_multiple_votes: row.allow_multiple_votes,
            total_votes: row.total_votes,
        })
        .collect())
}

async fn load_poll(conn: &mut PgConnection, poll_id: PollId) -> StoreResult<Poll> {
    let row: Option<PollRow> = sqlx::query_as(&format!(
        "SELECT {POLL_COLUMNS} FROM room_polls WHERE id = $1"
    ))
    .bind(poll_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let row = row.ok_or(StoreError::NotFound("Poll"))?;
    hydrate_polls(conn, vec![row])
        .await?
        .pop()
        .ok_or(StoreError::NotFound("Poll"))
}

#[async_trait]
impl RoomStore for PgStore {
    async fn create_room(
        &self,
        new: NewRoom,
        creator_id: UserId,
        creator_name: &str,
    ) -> StoreResult<Room> {
        let draft = new.into_draft()?;
        let room_id = RoomId::new();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO revision_rooms
                (id, name, description, unit_id, unit_code, faculty_code, topic, tags, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(room_id.0)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(draft.unit_id)
        .bind(&draft.unit_code)
        .bind(&draft.faculty_code)
        .bind(&draft.topic)
        .bind(&draft.tags)
        .bind(creator_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO room_participants (room_id, user_id, display_name, status)
            VALUES ($1, $2, $3, 'active')
            "#,
        )
        .bind(room_id.0)
        .bind(creator_id.0)
        .bind(creator_name)
        .execute(&mut *tx)
        .await?;

        let room = load_room(&mut tx, room_id).await?;
        tx.commit().await?;

        tracing::info!(room_id = %room.id, created_by = %creator_id, "Revision room created");
        Ok(room)
    }

    async fn get_room(&self, room_id: RoomId) -> StoreResult<Room> {
        let mut conn = self.pool.acquire().await?;
        load_room(&mut conn, room_id).await
    }

    async fn list_active_rooms(&self, filter: &RoomFilter, page: Page) -> StoreResult<Vec<Room>> {
        let pattern = filter.search_term().map(|term| {
            let escaped = term
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{escaped}%")
        });

        let mut conn = self.pool.acquire().await?;
        let rows: Vec<RoomRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ROOM_COLUMNS}
            FROM revision_rooms
            WHERE is_active
              AND ($1::uuid IS NULL OR unit_id = $1)
              AND ($2::text IS NULL OR name ILIKE $2 OR topic ILIKE $2 OR unit_code ILIKE $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.unit_id)
        .bind(pattern)
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *conn)
        .await?;

        hydrate_rooms(&mut conn, rows).await
    }

    async fn list_rooms_for_participant(&self, user_id: UserId) -> StoreResult<Vec<Room>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<RoomRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.name, r.description, r.unit_id, r.unit_code, r.faculty_code, r.topic,
                   r.current_focus, r.is_active, r.tags, r.created_by, r.created_at
            FROM revision_rooms r
            JOIN room_participants p ON p.room_id = r.id
            WHERE p.user_id = $1
            ORDER BY r.created_at DESC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&mut *conn)
        .await?;

        hydrate_rooms(&mut conn, rows).await
    }

    async fn last_seq(&self, room_id: RoomId) -> StoreResult<u64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT event_seq FROM revision_rooms WHERE id = $1")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        seq.map(|seq| seq.max(0) as u64)
            .ok_or(StoreError::NotFound("Room"))
    }

    async fn add_or_update_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
        display_name: &str,
    ) -> StoreResult<Committed<Room>> {
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        claim.require_active()?;

        // joined_at is kept on rejoin so roster order stays by first join
        sqlx::query(
            r#"
            INSERT INTO room_participants (room_id, user_id, display_name, status)
            VALUES ($1, $2, $3, 'active')
            ON CONFLICT (room_id, user_id) DO UPDATE SET
              display_name = EXCLUDED.display_name,
              status = 'active'
            "#,
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(display_name)
        .execute(&mut *tx)
        .await?;

        let room = load_room(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(Committed::new(room, claim.seq))
    }

    async fn set_participant_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> StoreResult<Committed<Room>> {
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        let result = sqlx::query(
            "UPDATE room_participants SET status = $3 WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Participant"));
        }
        let room = load_room(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(Committed::new(room, claim.seq))
    }

    async fn set_focus(&self, room_id: RoomId, topic: &str) -> StoreResult<Committed<Room>> {
        let focus = Some(topic.trim()).filter(|t| !t.is_empty());
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        claim.require_active()?;

        sqlx::query("UPDATE revision_rooms SET current_focus = $2 WHERE id = $1")
            .bind(room_id.0)
            .bind(focus)
            .execute(&mut *tx)
            .await?;

        let room = load_room(&mut tx, room_id).await?;
        tx.commit().await?;
        Ok(Committed::new(room, claim.seq))
    }

    async fn add_resource(
        &self,
        room_id: RoomId,
        added_by: UserId,
        resource: NewResource,
    ) -> StoreResult<Committed<Resource>> {
        let resource = resource.into_resource(added_by)?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        claim.require_active()?;

        sqlx::query(
            r#"
            INSERT INTO room_resources
                (id, room_id, resource_type, reference_id, title, url, added_by, added_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(resource.id)
        .bind(room_id.0)
        .bind(resource.resource_type.as_str())
        .bind(&resource.reference_id)
        .bind(&resource.title)
        .bind(&resource.url)
        .bind(added_by.0)
        .bind(resource.added_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Committed::new(resource, claim.seq))
    }

    async fn update_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
        update: RoomUpdate,
    ) -> StoreResult<Committed<Room>> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        if claim.owner != requested_by {
            return Err(StoreError::Forbidden(
                "Only the room creator can update the room".into(),
            ));
        }
        claim.require_active()?;

        let mut room = load_room(&mut tx, room_id).await?;
        update.apply(&mut room);

        sqlx::query(
            r#"
            UPDATE revision_rooms
            SET name = $2, description = $3, topic = $4, current_focus = $5, tags = $6
            WHERE id = $1
            "#,
        )
        .bind(room_id.0)
        .bind(&room.name)
        .bind(&room.description)
        .bind(&room.topic)
        .bind(&room.current_focus)
        .bind(&room.tags)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Committed::new(room, claim.seq))
    }

    async fn close_room(
        &self,
        room_id: RoomId,
        requested_by: UserId,
    ) -> StoreResult<Committed<ClosedRoom>> {
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        if claim.owner != requested_by {
            return Err(StoreError::Forbidden(
                "Only the room creator can close the room".into(),
            ));
        }

        sqlx::query("UPDATE revision_rooms SET is_active = FALSE WHERE id = $1")
            .bind(room_id.0)
            .execute(&mut *tx)
            .await?;

        let room = load_room(&mut tx, room_id).await?;
        tx.commit().await?;

        if claim.is_active {
            tracing::info!(room_id = %room_id, closed_by = %requested_by, "Revision room closed");
        }
        Ok(Committed::new(
            ClosedRoom {
                room,
                transitioned: claim.is_active,
            },
            claim.seq,
        ))
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn post_message(&self, new: NewMessage) -> StoreResult<Committed<Message>> {
        let content = new.checked_content()?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, new.room_id).await?;
        claim.require_active()?;

        // Unknown or cross-room parents are flattened to top-level messages
        let parent_id = match new.parent_id {
            Some(parent_id) => {
                let same_room: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM room_messages WHERE id = $1 AND room_id = $2)",
                )
                .bind(parent_id.0)
                .bind(new.room_id.0)
                .fetch_one(&mut *tx)
                .await?;
                same_room.then_some(parent_id)
            }
            None => None,
        };

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
        insert_message(&mut tx, &message).await?;

        let message = load_message(&mut tx, message.id).await?;
        tx.commit().await?;
        Ok(Committed::new(message, claim.seq))
    }

    async fn get_message(&self, message_id: MessageId) -> StoreResult<Message> {
        let mut conn = self.pool.acquire().await?;
        load_message(&mut conn, message_id).await
    }

    async fn list_recent(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            {MESSAGE_SELECT}
            WHERE m.room_id = $1
              AND ($2::timestamptz IS NULL OR m.created_at < $2)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT $3
            "#
        ))
        .bind(room_id.0)
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn list_replies(&self, parent_id: MessageId) -> StoreResult<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        load_message(&mut conn, parent_id).await?;

        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT} WHERE m.parent_id = $1 ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(parent_id.0)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> StoreResult<Committed<Message>> {
        let room_id = message_room(&self.pool, message_id).await?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO message_likes (message_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyLiked);
        }

        sqlx::query("UPDATE room_messages SET like_count = like_count + 1 WHERE id = $1")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        let message = load_message(&mut tx, message_id).await?;
        tx.commit().await?;
        Ok(Committed::new(message, claim.seq))
    }

    async fn unlike(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> StoreResult<Committed<Message>> {
        let room_id = message_room(&self.pool, message_id).await?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;

        let deleted = sqlx::query("DELETE FROM message_likes WHERE message_id = $1 AND user_id = $2")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotLiked);
        }

        sqlx::query("UPDATE room_messages SET like_count = like_count - 1 WHERE id = $1")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        let message = load_message(&mut tx, message_id).await?;
        tx.commit().await?;
        Ok(Committed::new(message, claim.seq))
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn create_poll(&self, new: NewPoll) -> StoreResult<Committed<(Poll, Message)>> {
        let (poll, announcement) = new.into_records(OffsetDateTime::now_utc())?;

        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, poll.room_id).await?;
        claim.require_active()?;

        insert_message(&mut tx, &announcement).await?;

        sqlx::query(
            r#"
            INSERT INTO room_polls
                (id, room_id, message_id, question, created_by, created_at, expires_at,
                 is_active, allow_multiple_votes, total_votes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, 0)
            "#,
        )
        .bind(poll.id.0)
        .bind(poll.room_id.0)
        .bind(poll.message_id.map(|id| id.0))
        .bind(&poll.question)
        .bind(poll.created_by.0)
        .bind(poll.created_at)
        .bind(poll.expires_at)
        .bind(poll.allow_multiple_votes)
        .execute(&mut *tx)
        .await?;

        for (index, option) in poll.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO poll_options (poll_id, option_index, text) VALUES ($1, $2, $3)",
            )
            .bind(poll.id.0)
            .bind(index as i32)
            .bind(&option.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            poll_id = %poll.id,
            room_id = %poll.room_id,
            message_id = %announcement.id,
            "Poll created with announcement"
        );
        Ok(Committed::new((poll, announcement), claim.seq))
    }

    async fn get_poll(&self, poll_id: PollId) -> StoreResult<Poll> {
        let mut conn = self.pool.acquire().await?;
        load_poll(&mut conn, poll_id).await
    }

    async fn cast_vote(
        &self,
        poll_id: PollId,
        option_index: usize,
        user_id: UserId,
    ) -> StoreResult<Committed<Poll>> {
        let room_id = poll_room(&self.pool, poll_id).await?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;

        let guard: Option<VoteGuardRow> = sqlx::query_as(
            r#"
            SELECT is_active,
                   (expires_at IS NOT NULL AND expires_at <= NOW()) AS expired,
                   allow_multiple_votes
            FROM room_polls
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(poll_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let guard = guard.ok_or(StoreError::NotFound("Poll"))?;
        if !guard.is_active || guard.expired {
            return Err(StoreError::Inactive("Poll"));
        }

        let option_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM poll_options WHERE poll_id = $1")
                .bind(poll_id.0)
                .fetch_one(&mut *tx)
                .await?;
        let index = i32::try_from(option_index)
            .ok()
            .filter(|i| i64::from(*i) < option_count)
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("Option index {option_index} is out of range"))
            })?;

        if !guard.allow_multiple_votes {
            let already: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM poll_votes WHERE poll_id = $1 AND user_id = $2)",
            )
            .bind(poll_id.0)
            .bind(user_id.0)
            .fetch_one(&mut *tx)
            .await?;
            if already {
                return Err(StoreError::AlreadyVoted);
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO poll_votes (poll_id, option_index, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (poll_id, option_index, user_id) DO NOTHING
            "#,
        )
        .bind(poll_id.0)
        .bind(index)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyVoted);
        }

        sqlx::query(
            "UPDATE poll_options SET vote_count = vote_count + 1 WHERE poll_id = $1 AND option_index = $2",
        )
        .bind(poll_id.0)
        .bind(index)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE room_polls SET total_votes = total_votes + 1 WHERE id = $1")
            .bind(poll_id.0)
            .execute(&mut *tx)
            .await?;

        let poll = load_poll(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(Committed::new(poll, claim.seq))
    }

    async fn close_poll(&self, poll_id: PollId) -> StoreResult<Committed<ClosedPoll>> {
        let room_id = poll_room(&self.pool, poll_id).await?;
        let mut tx = self.pool.begin().await?;
        let claim = claim_seq(&mut tx, room_id).await?;
        let result = sqlx::query(
            "UPDATE room_polls SET is_active = FALSE, closed_at = NOW() WHERE id = $1 AND is_active",
        )
        .bind(poll_id.0)
        .execute(&mut *tx)
        .await?;

        let poll = load_poll(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(Committed::new(
            ClosedPoll {
                poll,
                transitioned: result.rows_affected() > 0,
            },
            claim.seq,
        ))
    }

    async fn get_active_polls(&self, room_id: RoomId) -> StoreResult<Vec<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<PollRow> = sqlx::query_as(&format!(
            "SELECT {POLL_COLUMNS} FROM room_polls WHERE room_id = $1 AND is_active ORDER BY created_at DESC"
        ))
        .bind(room_id.0)
        .fetch_all(&mut *conn)
        .await?;

        hydrate_polls(&mut conn, rows).await
    }

    async fn list_scheduled_polls(&self) -> StoreResult<Vec<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<PollRow> = sqlx::query_as(&format!(
            "SELECT {POLL_COLUMNS} FROM room_polls WHERE is_active AND expires_at IS NOT NULL ORDER BY expires_at ASC"
        ))
        .fetch_all(&mut *conn)
        .await?;

        hydrate_polls(&mut conn, rows).await
    }

    async fn list_expired_open_polls(&self, now: OffsetDateTime) -> StoreResult<Vec<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<PollRow> = sqlx::query_as(&format!(
            "SELECT {POLL_COLUMNS} FROM room_polls WHERE is_active AND expires_at <= $1 ORDER BY expires_at ASC"
        ))
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        hydrate_polls(&mut conn, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::db::create_pool(&url, crate::db::PoolSettings::default())
            .await
            .expect("Failed to create pool");
        crate::db::run_migrations(&pool).await.expect("Failed to run migrations");
        PgStore::new(pool)
    }

    fn new_room() -> NewRoom {
        NewRoom {
            name: "Algorithms revision".into(),
            unit_id: Some(Uuid::new_v4()),
            unit_code: "COMP2123".into(),
            topic: "Graphs".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_concurrent_same_user_votes_single_winner() {
        let store = std::sync::Arc::new(store().await);
        let creator = UserId::new();
        let room = store.create_room(new_room(), creator, "Ada").await.unwrap();
        let (poll, _) = store
            .create_poll(NewPoll {
                room_id: room.id,
                created_by: creator,
                creator_name: "Ada".into(),
                question: "Topic A or B?".into(),
                options: vec!["A".into(), "B".into()],
                duration_minutes: Some(5),
                allow_multiple_votes: false,
            })
            .await
            .unwrap()
            .value;

        let voter = UserId::new();
        let poll_id = poll.id;
        let mut handles = Vec::new();
        for i in 0..8usize {
            let store = std::sync::Arc::clone(&store);
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

        let poll = store.get_poll(poll.id).await.unwrap();
        assert_eq!(poll.total_votes, 1);
        assert_eq!(poll.tally().iter().sum::<i64>(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_like_twice_is_rejected() {
        let store = store().await;
        let author = UserId::new();
        let room = store.create_room(new_room(), author, "Ada").await.unwrap();
        let message = store
            .post_message(NewMessage::text(room.id, author, "Ada", "hello"))
            .await
            .unwrap();
        assert_eq!(message.seq, 1);
        let message = message.value;

        let liked = store.like(message.id, author).await.unwrap();
        assert_eq!(liked.seq, 2);
        assert_eq!(liked.value.like_count, 1);
        assert!(matches!(
            store.like(message.id, author).await,
            Err(StoreError::AlreadyLiked)
        ));
        let unliked = store.unlike(message.id, author).await.unwrap().value;
        assert_eq!(unliked.like_count, 0);
        assert!(unliked.liked_by.is_empty());
        assert_eq!(store.last_seq(room.id).await.unwrap(), 3);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_closed_room_rejects_messages_and_polls() {
        let store = store().await;
        let creator = UserId::new();
        let room = store.create_room(new_room(), creator, "Ada").await.unwrap();
        let closed = store.close_room(room.id, creator).await.unwrap();
        assert!(closed.value.transitioned);

        assert!(matches!(
            store
                .post_message(NewMessage::text(room.id, creator, "Ada", "anyone?"))
                .await,
            Err(StoreError::Inactive("Room"))
        ));
        let poll = NewPoll {
            room_id: room.id,
            created_by: creator,
            creator_name: "Ada".into(),
            question: "Topic A or B?".into(),
            options: vec!["A".into(), "B".into()],
            duration_minutes: None,
            allow_multiple_votes: false,
        };
        assert!(matches!(
            store.create_poll(poll).await,
            Err(StoreError::Inactive("Room"))
        ));

        // Rejected writes roll their sequence number back
        assert_eq!(store.last_seq(room.id).await.unwrap(), closed.seq);
        assert!(store.list_recent(room.id, 10, None).await.unwrap().is_empty());
    }
}
