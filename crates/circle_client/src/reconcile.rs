//! Pure timeline state machine: merges optimistic local sends with server
//! echoes and keeps the timeline in a deterministic order.
//!
//! Per-message lifecycle: `LocalPending -> LocalConfirmed | SendFailed`,
//! `SendFailed -> LocalConfirmed` on a late echo, and `-> Remote` for
//! everything that did not originate here. Nothing in this module does I/O or
//! reads the clock; callers pass `now`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use circle_shared::{
    domain::{CircleId, UserId},
    protocol::MessagePayload,
};

use crate::{
    error::EngineError,
    types::{LocalId, Message, MessageOrigin, TimelineSnapshot},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDraft {
    pub author_id: UserId,
    pub display_name: String,
    pub body: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A pending local entry was matched and confirmed in place.
    Promoted {
        local_id: LocalId,
        /// More than one pending entry matched; the earliest was consumed.
        ambiguous: bool,
    },
    Appended { local_id: LocalId },
    /// Same `server_id` already on the timeline.
    Duplicate,
    /// Message belongs to a circle this timeline is not tracking.
    Ignored,
}

#[derive(Debug)]
pub struct ReconciliationEngine {
    matching_window: TimeDelta,
    circle_id: Option<CircleId>,
    epoch: u64,
    next_local_id: u64,
    messages: Vec<Message>,
}

impl ReconciliationEngine {
    pub fn new(matching_window: Duration) -> Self {
        Self {
            matching_window: TimeDelta::from_std(matching_window).unwrap_or(TimeDelta::MAX),
            circle_id: None,
            epoch: 0,
            next_local_id: 1,
            messages: Vec::new(),
        }
    }

    pub fn circle_id(&self) -> Option<&CircleId> {
        self.circle_id.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, local_id: LocalId) -> Option<&Message> {
        self.messages.iter().find(|m| m.local_id == local_id)
    }

    /// Discards all state and starts a new timeline for `circle_id`. Returns
    /// the new epoch; anything tagged with an older epoch is stale.
    pub fn reset(&mut self, circle_id: Option<CircleId>) -> u64 {
        self.messages.clear();
        self.circle_id = circle_id;
        self.epoch += 1;
        self.epoch
    }

    pub fn has_confirmed_data(&self) -> bool {
        self.messages.iter().any(Message::is_server_confirmed)
    }

    pub fn record_local(
        &mut self,
        draft: LocalDraft,
        now: DateTime<Utc>,
    ) -> Result<LocalId, EngineError> {
        let circle_id = self.circle_id.clone().ok_or(EngineError::NotJoined)?;
        if draft.body.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        let local_id = self.allocate_id();
        self.insert(Message {
            local_id,
            server_id: None,
            circle_id,
            author_id: draft.author_id,
            display_name: draft.display_name,
            body: draft.body,
            sent_at: now,
            server_timestamp: None,
            origin: MessageOrigin::LocalPending,
            is_anonymous: draft.is_anonymous,
            is_seed: false,
        });
        Ok(local_id)
    }

    pub fn apply_remote(&mut self, payload: &MessagePayload, now: DateTime<Utc>) -> Reconciled {
        if self.circle_id.as_ref() != Some(&payload.circle_id) {
            return Reconciled::Ignored;
        }

        if self
            .messages
            .iter()
            .any(|m| !m.is_seed && m.server_id.as_ref() == Some(&payload.server_id))
        {
            return Reconciled::Duplicate;
        }

        // An exact sent_at match names the send; otherwise the earliest
        // pending send with the same author and body is consumed.
        let candidates: Vec<(LocalId, DateTime<Utc>)> = self
            .messages
            .iter()
            .filter(|m| self.is_echo_candidate(m, payload, now))
            .map(|m| (m.local_id, m.sent_at))
            .collect();
        let exact: Vec<LocalId> = candidates
            .iter()
            .filter(|(_, sent_at)| *sent_at == payload.sent_at)
            .map(|(local_id, _)| *local_id)
            .collect();
        let chosen = match exact.iter().min() {
            Some(&local_id) => Some((local_id, exact.len() > 1)),
            None => candidates
                .iter()
                .map(|(local_id, _)| *local_id)
                .min()
                .map(|local_id| (local_id, candidates.len() > 1)),
        };
        if let Some((local_id, ambiguous)) = chosen {
            self.confirm(local_id, payload);
            return Reconciled::Promoted {
                local_id,
                ambiguous,
            };
        }

        // Same (author, sent_at) as an unconfirmed local entry: the server copy
        // wins, even if the entry already timed out.
        if let Some(local_id) = self
            .messages
            .iter()
            .filter(|m| {
                m.server_id.is_none()
                    && !m.is_seed
                    && m.author_id == payload.author_id
                    && m.sent_at == payload.sent_at
            })
            .map(|m| m.local_id)
            .min()
        {
            self.confirm(local_id, payload);
            return Reconciled::Promoted {
                local_id,
                ambiguous: false,
            };
        }

        let local_id = self.allocate_id();
        self.insert(Message {
            local_id,
            server_id: Some(payload.server_id.clone()),
            circle_id: payload.circle_id.clone(),
            author_id: payload.author_id.clone(),
            display_name: payload.display_name.clone(),
            body: payload.body.clone(),
            sent_at: payload.sent_at,
            server_timestamp: Some(payload.server_timestamp),
            origin: MessageOrigin::Remote,
            is_anonymous: payload.is_anonymous,
            is_seed: false,
        });
        Reconciled::Appended { local_id }
    }

    /// Applies a history backlog in delivery order. Returns how many entries
    /// were added or confirmed.
    pub fn apply_backlog(&mut self, payloads: &[MessagePayload], now: DateTime<Utc>) -> usize {
        payloads
            .iter()
            .map(|payload| self.apply_remote(payload, now))
            .filter(|outcome| {
                matches!(
                    outcome,
                    Reconciled::Appended { .. } | Reconciled::Promoted { .. }
                )
            })
            .count()
    }

    /// Loads fallback messages unless real server data is already present.
    pub fn seed(&mut self, seed: Vec<Message>) -> bool {
        if self.has_confirmed_data() {
            return false;
        }
        let Some(circle_id) = self.circle_id.clone() else {
            return false;
        };

        self.messages.retain(|m| !m.is_seed);
        for mut message in seed {
            if message.circle_id != circle_id {
                continue;
            }
            message.local_id = self.allocate_id();
            message.origin = MessageOrigin::Remote;
            message.is_seed = true;
            self.insert(message);
        }
        true
    }

    /// Marks a still-pending send as failed. Returns false if the entry was
    /// already confirmed, failed, or no longer exists.
    pub fn mark_send_failed(&mut self, local_id: LocalId) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.local_id == local_id && m.origin == MessageOrigin::LocalPending)
        {
            Some(message) => {
                message.origin = MessageOrigin::SendFailed;
                true
            }
            None => false,
        }
    }

    /// Removes a failed entry so it can be re-sent under a new local id.
    pub fn take_failed(&mut self, local_id: LocalId) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.local_id == local_id && m.origin == MessageOrigin::SendFailed)?;
        Some(self.messages.remove(index))
    }

    pub fn pending_ids(&self) -> Vec<LocalId> {
        self.messages
            .iter()
            .filter(|m| m.origin == MessageOrigin::LocalPending)
            .map(|m| m.local_id)
            .collect()
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            circle_id: self.circle_id.clone(),
            epoch: self.epoch,
            messages: self.messages.clone(),
        }
    }

    fn is_echo_candidate(
        &self,
        message: &Message,
        payload: &MessagePayload,
        now: DateTime<Utc>,
    ) -> bool {
        message.origin == MessageOrigin::LocalPending
            && message.server_id.is_none()
            && message.author_id == payload.author_id
            && message.body == payload.body
            && now.signed_duration_since(message.sent_at) <= self.matching_window
    }

    fn confirm(&mut self, local_id: LocalId, payload: &MessagePayload) {
        let Some(index) = self.messages.iter().position(|m| m.local_id == local_id) else {
            return;
        };
        let mut message = self.messages.remove(index);
        message.server_id = Some(payload.server_id.clone());
        message.server_timestamp = Some(payload.server_timestamp);
        message.origin = MessageOrigin::LocalConfirmed;
        self.insert(message);
    }

    fn insert(&mut self, message: Message) {
        let key = message.sort_key();
        let index = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(index, message);
    }

    fn allocate_id(&mut self) -> LocalId {
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        id
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
