//! WebSocket event types and serialization
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.
//! Inbound payload fields are camelCase (`roomId`, `parentId`), outbound
//! payloads use the snake_case field names of the domain types.

use revroom_shared::{
    Message, MessageId, NewResource, Participant, ParticipantStatus, Poll, PollId, Resource, Room,
    RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
    },

    LeaveRoom {
        room_id: RoomId,
    },

    ListRooms {
        #[serde(default)]
        unit_id: Option<Uuid>,
        #[serde(default)]
        search: Option<String>,
    },

    ChangeStatus {
        room_id: RoomId,
        status: String,
    },

    SetFocus {
        room_id: RoomId,
        topic: String,
    },

    ShareResource {
        room_id: RoomId,
        resource: NewResource,
    },

    HighlightResource {
        room_id: RoomId,
        resource_id: String,
        #[serde(default)]
        position: serde_json::Value,
    },

    SendMessage {
        room_id: RoomId,
        content: String,
        #[serde(default)]
        parent_id: Option<MessageId>,
        #[serde(default, rename = "type")]
        message_type: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },

    Typing {
        room_id: RoomId,
    },

    LikeMessage {
        message_id: MessageId,
    },

    UnlikeMessage {
        message_id: MessageId,
    },

    CreatePoll {
        room_id: RoomId,
        poll_data: PollData,
    },

    VotePoll {
        poll_id: PollId,
        option_index: i64,
    },

    ClosePoll {
        poll_id: PollId,
    },

    /// Heartbeat ping to keep connection alive
    Ping,
}

impl ClientEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::ListRooms { .. } => "list_rooms",
            Self::ChangeStatus { .. } => "change_status",
            Self::SetFocus { .. } => "set_focus",
            Self::ShareResource { .. } => "share_resource",
            Self::HighlightResource { .. } => "highlight_resource",
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::LikeMessage { .. } => "like_message",
            Self::UnlikeMessage { .. } => "unlike_message",
            Self::CreatePoll { .. } => "create_poll",
            Self::VotePoll { .. } => "vote_poll",
            Self::ClosePoll { .. } => "close_poll",
            Self::Ping => "ping",
        }
    }
}

/// Poll definition carried by `create_poll`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollData {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Minutes until the poll closes on its own
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub allow_multiple_votes: bool,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected { session_id: Uuid },

    /// Snapshot sent only to the joining connection
    RoomJoined {
        room: Room,
        active_polls: Vec<Poll>,
    },

    UserJoined {
        room_id: RoomId,
        participant: Participant,
        participant_count: usize,
    },

    UserLeft {
        room_id: RoomId,
        user_id: UserId,
        display_name: String,
    },

    StatusChanged {
        room_id: RoomId,
        user_id: UserId,
        status: ParticipantStatus,
    },

    FocusChanged {
        room_id: RoomId,
        topic: Option<String>,
        changed_by: UserId,
    },

    ResourceShared {
        room_id: RoomId,
        resource: Resource,
    },

    ResourceHighlighted {
        room_id: RoomId,
        resource_id: String,
        position: serde_json::Value,
        highlighted_by: UserId,
    },

    NewMessage {
        room_id: RoomId,
        message: Message,
    },

    UserTyping {
        room_id: RoomId,
        user_id: UserId,
        display_name: String,
    },

    MessageLiked {
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        like_count: i64,
    },

    MessageUnliked {
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        like_count: i64,
    },

    PollCreated {
        room_id: RoomId,
        poll: Poll,
    },

    PollVote {
        room_id: RoomId,
        poll_id: PollId,
        option_index: usize,
        voter_id: UserId,
        tally: Vec<i64>,
        total_votes: i64,
    },

    /// Final state of a poll; `poll.is_active` is false
    PollClosed {
        room_id: RoomId,
        poll: Poll,
    },

    /// Sent only to the requester
    RoomsList { rooms: Vec<Room> },

    RoomClosed { room_id: RoomId },

    /// Heartbeat response
    Pong,

    /// Rejection of the originating connection's last event
    Error { message: String },
}

impl ServerEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RoomJoined { .. } => "room_joined",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::StatusChanged { .. } => "status_changed",
            Self::FocusChanged { .. } => "focus_changed",
            Self::ResourceShared { .. } => "resource_shared",
            Self::ResourceHighlighted { .. } => "resource_highlighted",
            Self::NewMessage { .. } => "new_message",
            Self::UserTyping { .. } => "user_typing",
            Self::MessageLiked { .. } => "message_liked",
            Self::MessageUnliked { .. } => "message_unliked",
            Self::PollCreated { .. } => "poll_created",
            Self::PollVote { .. } => "poll_vote",
            Self::PollClosed { .. } => "poll_closed",
            Self::RoomsList { .. } => "rooms_list",
            Self::RoomClosed { .. } => "room_closed",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}
