//! Best-effort online count and typing indicators for the active circle.
//!
//! Derived only from events this client observes. The value is for display;
//! capacity and access decisions stay with the server.

use std::collections::{BTreeMap, HashSet};

use circle_shared::domain::{CircleId, UserId};

use crate::types::{ConnectionState, PresenceSnapshot};

#[derive(Debug)]
pub struct PresenceTracker {
    self_id: UserId,
    circle_id: Option<CircleId>,
    baseline: u32,
    arrived: HashSet<UserId>,
    departed: HashSet<UserId>,
    typing: BTreeMap<UserId, String>,
    self_online: bool,
}

impl PresenceTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            circle_id: None,
            baseline: 0,
            arrived: HashSet::new(),
            departed: HashSet::new(),
            typing: BTreeMap::new(),
            self_online: false,
        }
    }

    /// Starts tracking `circle_id`; `baseline` is the server count from the
    /// join acknowledgement, if one arrived.
    pub fn enter(&mut self, circle_id: CircleId, baseline: Option<u32>, connected: bool) {
        self.circle_id = Some(circle_id);
        self.baseline = baseline.unwrap_or(0);
        self.arrived.clear();
        self.departed.clear();
        self.typing.clear();
        self.self_online = connected;
    }

    pub fn exit(&mut self) {
        self.circle_id = None;
        self.baseline = 0;
        self.arrived.clear();
        self.departed.clear();
        self.typing.clear();
    }

    pub fn member_joined(&mut self, circle_id: &CircleId, user_id: &UserId) {
        if !self.tracks(circle_id) || *user_id == self.self_id {
            return;
        }
        if !self.departed.remove(user_id) {
            self.arrived.insert(user_id.clone());
        }
    }

    pub fn member_left(&mut self, circle_id: &CircleId, user_id: &UserId) {
        if !self.tracks(circle_id) || *user_id == self.self_id {
            return;
        }
        self.typing.remove(user_id);
        if !self.arrived.remove(user_id) {
            self.departed.insert(user_id.clone());
        }
    }

    /// Returns true when the visible typing list changed.
    pub fn typing_started(
        &mut self,
        circle_id: &CircleId,
        user_id: &UserId,
        display_name: &str,
    ) -> bool {
        if !self.tracks(circle_id) || *user_id == self.self_id {
            return false;
        }
        let name = if display_name.is_empty() {
            user_id.as_str().to_string()
        } else {
            display_name.to_string()
        };
        self.typing.insert(user_id.clone(), name.clone()).as_ref() != Some(&name)
    }

    pub fn typing_stopped(&mut self, circle_id: &CircleId, user_id: &UserId) -> bool {
        self.tracks(circle_id) && self.typing.remove(user_id).is_some()
    }

    /// A server-pushed count replaces everything derived locally.
    pub fn server_count(&mut self, circle_id: &CircleId, online_count: u32) {
        if !self.tracks(circle_id) {
            return;
        }
        self.baseline = online_count;
        self.arrived.clear();
        self.departed.clear();
    }

    pub fn connection_changed(&mut self, state: ConnectionState) {
        self.self_online = state == ConnectionState::Connected;
    }

    pub fn online_count(&self) -> u32 {
        if self.circle_id.is_none() {
            return 0;
        }
        let derived = (u64::from(self.baseline) + self.arrived.len() as u64)
            .saturating_sub(self.departed.len() as u64);
        let derived = u32::try_from(derived).unwrap_or(u32::MAX);
        derived.max(u32::from(self.self_online))
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            circle_id: self.circle_id.clone(),
            online_count: self.online_count(),
            typing: self.typing.values().cloned().collect(),
        }
    }

    fn tracks(&self, circle_id: &CircleId) -> bool {
        self.circle_id.as_ref() == Some(circle_id)
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
