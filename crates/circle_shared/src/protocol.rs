use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Circle, CircleId, ServerMessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        user_id: UserId,
        display_name: String,
    },
    JoinCircle {
        circle_id: CircleId,
    },
    LeaveCircle {
        circle_id: CircleId,
    },
    SendMessage {
        circle_id: CircleId,
        author_id: UserId,
        display_name: String,
        body: String,
        sent_at: DateTime<Utc>,
        is_anonymous: bool,
    },
    TypingStart {
        circle_id: CircleId,
        display_name: String,
    },
    TypingStop {
        circle_id: CircleId,
        display_name: String,
    },
}

impl ClientRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinCircle { .. } => "join_circle",
            Self::LeaveCircle { .. } => "leave_circle",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
        }
    }
}

/// A circle message as broadcast by the server to every room member,
/// including the original sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub server_id: ServerMessageId,
    pub circle_id: CircleId,
    pub author_id: UserId,
    #[serde(default)]
    pub display_name: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        status: String,
        user_id: UserId,
    },
    Message(MessagePayload),
    MemberJoined {
        circle_id: CircleId,
        user_id: UserId,
    },
    MemberLeft {
        circle_id: CircleId,
        user_id: UserId,
    },
    Presence {
        circle_id: CircleId,
        online_count: u32,
    },
    /// Another member started typing. Relayed to the room, never persisted.
    UserTyping {
        circle_id: CircleId,
        user_id: UserId,
        #[serde(default)]
        display_name: String,
    },
    UserTypingStop {
        circle_id: CircleId,
        user_id: UserId,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCircleRequest {
    pub circle_id: CircleId,
    pub user_id: UserId,
}

/// Body returned by the REST join endpoint. Rejections arrive either as a
/// non-2xx status or as a 2xx body carrying `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinCircleResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circle: Option<Circle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: u32,
}
