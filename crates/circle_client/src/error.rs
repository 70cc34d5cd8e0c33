use std::time::Duration;

use circle_shared::domain::CircleId;
use thiserror::Error;

use crate::types::LocalId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("circle {circle_id} is full")]
    CircleFull { circle_id: CircleId },
    #[error("circle {circle_id} does not exist")]
    NotFound { circle_id: CircleId },
    #[error("join rejected for circle {circle_id}: {message}")]
    Rejected { circle_id: CircleId, message: String },
}

impl JoinError {
    pub fn circle_id(&self) -> &CircleId {
        match self {
            Self::CircleFull { circle_id }
            | Self::NotFound { circle_id }
            | Self::Rejected { circle_id, .. } => circle_id,
        }
    }

    /// Maps the free-form rejection text the circles service puts in its body.
    pub fn from_server_message(circle_id: CircleId, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("full") {
            Self::CircleFull { circle_id }
        } else if lower.contains("not found") {
            Self::NotFound { circle_id }
        } else {
            Self::Rejected {
                circle_id,
                message: message.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error("message {local_id} was not echoed within {timeout:?}")]
    SendTimeout { local_id: LocalId, timeout: Duration },
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("transport is not connected")]
    NotConnected,
    #[error("not joined to any circle")]
    NotJoined,
    #[error("message body is empty")]
    EmptyMessage,
    #[error("no failed message with local id {0}")]
    UnknownMessage(LocalId),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Self::Auth(err.to_string())
            }
            _ if err.is_decode() => Self::Protocol(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}
