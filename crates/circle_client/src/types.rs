use std::fmt;

use chrono::{DateTime, Utc};
use circle_shared::domain::{CircleId, ServerMessageId, UserId};

/// Client-assigned message identifier. Monotonic per client, so it doubles as
/// the insertion-order tie breaker for timeline sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOrigin {
    LocalPending,
    LocalConfirmed,
    SendFailed,
    Remote,
}

impl MessageOrigin {
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::LocalConfirmed | Self::Remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub local_id: LocalId,
    pub server_id: Option<ServerMessageId>,
    pub circle_id: CircleId,
    pub author_id: UserId,
    pub display_name: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub origin: MessageOrigin,
    pub is_anonymous: bool,
    /// Demo content from the fallback store; never real server state.
    pub is_seed: bool,
}

impl Message {
    pub fn sort_key(&self) -> (DateTime<Utc>, LocalId) {
        (self.server_timestamp.unwrap_or(self.sent_at), self.local_id)
    }

    pub fn is_server_confirmed(&self) -> bool {
        self.server_id.is_some() && !self.is_seed
    }
}

/// Immutable view of a circle timeline, published after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub circle_id: Option<CircleId>,
    pub epoch: u64,
    pub messages: Vec<Message>,
}

impl TimelineSnapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, local_id: LocalId) -> Option<&Message> {
        self.messages.iter().find(|m| m.local_id == local_id)
    }

    pub fn is_seeded(&self) -> bool {
        self.messages.iter().any(|m| m.is_seed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: UserId,
    pub display_name: String,
    pub token: String,
}

impl Credentials {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipMode {
    /// Join acknowledged and backlog loaded from the server.
    Live,
    /// Backend unreachable or silent; timeline seeded from the fallback store.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipHandle {
    pub circle_id: CircleId,
    pub epoch: u64,
    pub mode: MembershipMode,
    pub online_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub circle_id: Option<CircleId>,
    pub online_count: u32,
    /// Display names of other members currently typing, ordered by user id.
    pub typing: Vec<String>,
}
