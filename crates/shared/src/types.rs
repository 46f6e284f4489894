//! Common types used across the revision room platform

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper!(
    /// Revision room ID wrapper
    RoomId
);
id_wrapper!(
    /// User ID wrapper (the `sub` of a verified bearer token)
    UserId
);
id_wrapper!(
    /// Chat message ID wrapper
    MessageId
);
id_wrapper!(
    /// Poll ID wrapper
    PollId
);

// =============================================================================
// Limits
// =============================================================================

pub const MAX_ROOM_NAME_LEN: usize = 100;
pub const MAX_MESSAGE_LEN: usize = 2000;
pub const MAX_POLL_QUESTION_LEN: usize = 300;
pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 10;
pub const MAX_POLL_DURATION_MINUTES: u32 = 24 * 60;

// =============================================================================
// Enums
// =============================================================================

/// Presence status of a participant inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Idle,
    Away,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Away => "away",
        }
    }
}

impl FromStr for ParticipantStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "away" => Ok(Self::Away),
            other => Err(StoreError::InvalidArgument(format!(
                "Invalid status '{other}'. Must be active, idle, or away"
            ))),
        }
    }
}

/// Kind of study resource shared into a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    PastPaper,
    StudyNote,
    FlashcardSet,
    ExternalLink,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PastPaper => "past_paper",
            Self::StudyNote => "study_note",
            Self::FlashcardSet => "flashcard_set",
            Self::ExternalLink => "external_link",
        }
    }
}

impl FromStr for ResourceType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "past_paper" => Ok(Self::PastPaper),
            "study_note" => Ok(Self::StudyNote),
            "flashcard_set" => Ok(Self::FlashcardSet),
            "external_link" => Ok(Self::ExternalLink),
            other => Err(StoreError::InvalidArgument(format!(
                "Unknown resource type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Resource,
    Announcement,
    Poll,
    Timer,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Resource => "resource",
            Self::Announcement => "announcement",
            Self::Poll => "poll",
            Self::Timer => "timer",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "resource" => Ok(Self::Resource),
            "announcement" => Ok(Self::Announcement),
            "poll" => Ok(Self::Poll),
            "timer" => Ok(Self::Timer),
            "system" => Ok(Self::System),
            other => Err(StoreError::InvalidArgument(format!(
                "Unknown message type '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Rooms
// =============================================================================

/// A user's membership record inside a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub status: ParticipantStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// A study resource pinned to a room. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub reference_id: Option<String>,
    pub title: String,
    pub url: Option<String>,
    pub added_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default, alias = "referenceId")]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl NewResource {
    pub(crate) fn into_resource(self, added_by: UserId) -> StoreResult<Resource> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::Validation("Resource title is required".into()));
        }
        if self.resource_type == ResourceType::ExternalLink
            && self.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(StoreError::Validation(
                "External links require a URL".into(),
            ));
        }

        Ok(Resource {
            id: Uuid::new_v4(),
            resource_type: self.resource_type,
            reference_id: self.reference_id,
            title,
            url: self.url,
            added_by,
            added_at: OffsetDateTime::now_utc(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub unit_id: Uuid,
    pub unit_code: String,
    pub faculty_code: Option<String>,
    pub topic: String,
    pub current_focus: Option<String>,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Ordered by join time
    pub participants: Vec<Participant>,
    pub resources: Vec<Resource>,
}

impl Room {
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }

    /// Participants who have not left (status active or idle)
    pub fn is_active_participant(&self, user_id: &UserId) -> bool {
        self.participant(user_id)
            .is_some_and(|p| p.status != ParticipantStatus::Away)
    }
}

/// Request body for creating a room
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRoom {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "unitId")]
    pub unit_id: Option<Uuid>,
    #[serde(default, alias = "unitCode")]
    pub unit_code: String,
    #[serde(default, alias = "facultyCode")]
    pub faculty_code: Option<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A room creation request that passed validation
#[derive(Debug, Clone)]
pub(crate) struct RoomDraft {
    pub name: String,
    pub description: Option<String>,
    pub unit_id: Uuid,
    pub unit_code: String,
    pub faculty_code: Option<String>,
    pub topic: String,
    pub tags: Vec<String>,
}

impl NewRoom {
    pub(crate) fn into_draft(self) -> StoreResult<RoomDraft> {
        let name = self.name.trim().to_string();
        let unit_code = self.unit_code.trim().to_string();
        let topic = self.topic.trim().to_string();

        let mut missing = Vec::new();
        if name.is_empty() {
            missing.push("name");
        }
        if self.unit_id.is_none() {
            missing.push("unit_id");
        }
        if unit_code.is_empty() {
            missing.push("unit_code");
        }
        if topic.is_empty() {
            missing.push("topic");
        }
        let Some(unit_id) = self.unit_id.filter(|_| missing.is_empty()) else {
            return Err(StoreError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        };

        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(StoreError::Validation(format!(
                "Room name must be at most {MAX_ROOM_NAME_LEN} characters"
            )));
        }

        Ok(RoomDraft {
            name,
            description: self.description.filter(|d| !d.trim().is_empty()),
            unit_id,
            unit_code,
            faculty_code: self.faculty_code.filter(|f| !f.trim().is_empty()),
            topic,
            tags: normalize_tags(self.tags),
        })
    }
}

/// Partial update applied by the room creator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub topic: Option<String>,
    #[serde(alias = "currentFocus")]
    pub current_focus: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl RoomUpdate {
    pub(crate) fn validate(&self) -> StoreResult<()> {
        if let Some(name) = &self.name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
                return Err(StoreError::Validation(format!(
                    "Room name must be between 1 and {MAX_ROOM_NAME_LEN} characters"
                )));
            }
        }
        if self.topic.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(StoreError::Validation("Topic cannot be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn apply(self, room: &mut Room) {
        if let Some(name) = self.name {
            room.name = name.trim().to_string();
        }
        if let Some(description) = self.description {
            room.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(topic) = self.topic {
            room.topic = topic.trim().to_string();
        }
        if let Some(focus) = self.current_focus {
            room.current_focus = Some(focus).filter(|f| !f.trim().is_empty());
        }
        if let Some(tags) = self.tags {
            room.tags = normalize_tags(tags);
        }
    }
}

pub(crate) fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Filter for listing active rooms
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomFilter {
    #[serde(alias = "unitId")]
    pub unit_id: Option<Uuid>,
    pub search: Option<String>,
}

impl RoomFilter {
    /// Trimmed, non-empty search term
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn matches(&self, room: &Room) -> bool {
        if self.unit_id.is_some_and(|unit| unit != room.unit_id) {
            return false;
        }
        match self.search_term() {
            None => true,
            Some(term) => {
                let term = term.to_lowercase();
                room.name.to_lowercase().contains(&term)
                    || room.topic.to_lowercase().contains(&term)
                    || room.unit_code.to_lowercase().contains(&term)
            }
        }
    }
}

/// One-based page request
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_limit() -> u32 {
    20
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_page_limit(),
        }
    }
}

impl Page {
    pub const MAX_LIMIT: u32 = 100;

    pub fn limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> u32 {
        self.page.max(1).saturating_sub(1).saturating_mul(self.limit())
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Author and content of the message a reply points at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentPreview {
    pub id: MessageId,
    pub author_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub like_count: i64,
    pub liked_by: Vec<UserId>,
    pub parent_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    pub fn is_liked_by(&self, user_id: &UserId) -> bool {
        self.liked_by.contains(user_id)
    }

    pub fn preview(&self) -> ParentPreview {
        ParentPreview {
            id: self.id,
            author_name: self.author_name.clone(),
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub parent_id: Option<MessageId>,
    pub payload: Option<serde_json::Value>,
}

impl NewMessage {
    /// Plain text message with no reply target or payload
    pub fn text(room_id: RoomId, author_id: UserId, author_name: &str, content: &str) -> Self {
        Self {
            room_id,
            author_id,
            author_name: author_name.to_string(),
            content: content.to_string(),
            message_type: MessageType::Text,
            parent_id: None,
            payload: None,
        }
    }

    /// Trimmed content, rejecting empty or oversized text
    pub(crate) fn checked_content(&self) -> StoreResult<String> {
        let content = self.content.trim();
        if content.is_empty() {
            return Err(StoreError::Validation(
                "Message content cannot be empty".into(),
            ));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(StoreError::Validation(format!(
                "Message content must be at most {MAX_MESSAGE_LEN} characters"
            )));
        }
        Ok(content.to_string())
    }
}

// =============================================================================
// Polls
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub text: String,
    pub vote_count: i64,
    pub voters: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub room_id: RoomId,
    pub message_id: Option<MessageId>,
    pub question: String,
    pub options: Vec<PollOption>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub allow_multiple_votes: bool,
    pub total_votes: i64,
}

impl Poll {
    /// Whether the poll accepts votes at `now`
    pub fn is_open_at(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.expires_at.map_or(true, |deadline| now < deadline)
    }

    pub fn has_voted(&self, user_id: &UserId) -> bool {
        self.options.iter().any(|o| o.voters.contains(user_id))
    }

    /// Per-option vote counts in option order
    pub fn tally(&self) -> Vec<i64> {
        self.options.iter().map(|o| o.vote_count).collect()
    }

    /// Announcement payload stored on the companion message
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "poll_id": self.id,
            "question": self.question,
            "options": self.options.iter().map(|o| o.text.as_str()).collect::<Vec<_>>(),
            "expires_at": self.expires_at.and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok()),
            "allow_multiple_votes": self.allow_multiple_votes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub room_id: RoomId,
    pub created_by: UserId,
    /// Display name used for the companion announcement message
    pub creator_name: String,
    pub question: String,
    pub options: Vec<String>,
    pub duration_minutes: Option<u32>,
    pub allow_multiple_votes: bool,
}

impl NewPoll {
    /// Validate and build the poll plus its companion announcement message.
    ///
    /// Both records are returned unsaved; stores persist them together.
    pub(crate) fn into_records(self, now: OffsetDateTime) -> StoreResult<(Poll, Message)> {
        let question = self.question.trim().to_string();
        if question.is_empty() {
            return Err(StoreError::Validation("Poll question is required".into()));
        }
        if question.chars().count() > MAX_POLL_QUESTION_LEN {
            return Err(StoreError::Validation(format!(
                "Poll question must be at most {MAX_POLL_QUESTION_LEN} characters"
            )));
        }

        let options: Vec<String> = self
            .options
            .iter()
            .map(|o| o.trim().to_string())
            .collect();
        if options.len() < MIN_POLL_OPTIONS {
            return Err(StoreError::Validation(format!(
                "A poll needs at least {MIN_POLL_OPTIONS} options"
            )));
        }
        if options.len() > MAX_POLL_OPTIONS {
            return Err(StoreError::Validation(format!(
                "A poll can have at most {MAX_POLL_OPTIONS} options"
            )));
        }
        if options.iter().any(String::is_empty) {
            return Err(StoreError::Validation("Poll options cannot be empty".into()));
        }

        let expires_at = match self.duration_minutes {
            None => None,
            Some(minutes) if (1..=MAX_POLL_DURATION_MINUTES).contains(&minutes) => {
                Some(now + time::Duration::minutes(i64::from(minutes)))
            }
            Some(_) => {
                return Err(StoreError::Validation(format!(
                    "Poll duration must be between 1 and {MAX_POLL_DURATION_MINUTES} minutes"
                )))
            }
        };

        let message_id = MessageId::new();
        let poll = Poll {
            id: PollId::new(),
            room_id: self.room_id,
            message_id: Some(message_id),
            question,
            options: options
                .into_iter()
                .map(|text| PollOption {
                    text,
                    vote_count: 0,
                    voters: Vec::new(),
                })
                .collect(),
            created_by: self.created_by,
            created_at: now,
            expires_at,
            is_active: true,
            allow_multiple_votes: self.allow_multiple_votes,
            total_votes: 0,
        };

        let announcement = Message {
            id: message_id,
            room_id: self.room_id,
            author_id: self.created_by,
            author_name: self.creator_name,
            content: format!("Poll: {}", poll.question),
            message_type: MessageType::Poll,
            created_at: now,
            like_count: 0,
            liked_by: Vec::new(),
            parent_id: None,
            parent: None,
            payload: Some(poll.summary()),
        };

        Ok((poll, announcement))
    }
}

/// A write to a room together with its position in that room's commit order.
///
/// Sequence numbers start at 1 for the first write after creation and have
/// no gaps among successful writes, so listeners can release room events
/// exactly in the order the store applied them.
#[derive(Debug, Clone)]
pub struct Committed<T> {
    pub value: T,
    pub seq: u64,
}

impl<T> Committed<T> {
    pub fn new(value: T, seq: u64) -> Self {
        Self { value, seq }
    }
}

/// Result of a room close request
#[derive(Debug, Clone)]
pub struct ClosedRoom {
    pub room: Room,
    /// False when the room was already closed before this call
    pub transitioned: bool,
}

/// Result of a close request
#[derive(Debug, Clone)]
pub struct ClosedPoll {
    pub poll: Poll,
    /// False when the poll was already closed before this call
    pub transitioned: bool,
}
