//! Presence system for showing remote cursors, selections and typing state.
//!
//! Presence is full-state: every update carries a participant's complete
//! presence, so applying updates in any order converges to the latest one and
//! nothing here needs the operation history. Presence is never persisted.

use crate::ids::UserId;
use crate::operation::TextOperation;
use crate::transform::transform_index;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A selection as two character offsets. `head` is where the caret sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    /// Create a new selection
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    /// Check if this is a collapsed selection (cursor position)
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Ordered `(start, end)` offsets.
    pub fn range(&self) -> (usize, usize) {
        (self.anchor.min(self.head), self.anchor.max(self.head))
    }

    /// Map the selection through an operation applied to the document.
    pub fn transform(&self, op: &TextOperation) -> Self {
        Self {
            anchor: transform_index(self.anchor, op),
            head: transform_index(self.head, op),
        }
    }
}

/// Coarse activity status shown next to a participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// One participant's full presence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: UserId,
    pub display_name: String,
    /// Assigned color (hex)
    pub color: String,
    /// Caret offset in characters
    #[serde(default)]
    pub cursor: Option<usize>,
    #[serde(default)]
    pub selection: Option<Selection>,
    #[serde(default)]
    pub typing: bool,
    #[serde(default)]
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

impl PresenceState {
    /// Create a new presence state for a user
    pub fn new(user_id: UserId, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: color.into(),
            cursor: None,
            selection: None,
            typing: false,
            status: PresenceStatus::Active,
            last_activity: Utc::now(),
        }
    }

    /// Update cursor position
    pub fn set_cursor(&mut self, cursor: Option<usize>) {
        self.cursor = cursor;
        self.touch();
    }

    /// Update selection
    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection;
        self.touch();
    }

    /// Set typing indicator
    pub fn set_typing(&mut self, typing: bool) {
        self.typing = typing;
        self.touch();
    }

    pub fn set_status(&mut self, status: PresenceStatus) {
        self.status = status;
        self.touch();
    }

    /// Touch last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
        if self.status == PresenceStatus::Idle {
            self.status = PresenceStatus::Active;
        }
    }

    /// Shift cursor and selection through an operation applied to the document.
    pub fn transform(&mut self, op: &TextOperation) {
        self.cursor = self.cursor.map(|c| transform_index(c, op));
        self.selection = self.selection.map(|s| s.transform(op));
    }
}

/// Who a participant is, as resolved when they join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Remote caret and selection, ready for the editor to render.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCursor {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
    pub position: usize,
    pub selection: Option<Selection>,
    pub typing: bool,
}

/// Server-side roster of participants and their latest presence.
#[derive(Clone, Debug)]
pub struct PresenceManager {
    users: HashMap<UserId, PresenceState>,
    color_assignments: HashMap<UserId, String>,
    available_colors: Vec<String>,
    next_color_index: usize,
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceManager {
    /// Create a new presence manager
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            color_assignments: HashMap::new(),
            available_colors: default_colors(),
            next_color_index: 0,
        }
    }

    /// Add or replace a user's presence.
    pub fn update_user(&mut self, state: PresenceState) {
        self.color_assignments
            .entry(state.user_id.clone())
            .or_insert_with(|| state.color.clone());
        self.users.insert(state.user_id.clone(), state);
    }

    /// Remove a user; their color stays reserved for a later rejoin.
    pub fn remove_user(&mut self, user_id: &UserId) -> Option<PresenceState> {
        self.users.remove(user_id)
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&PresenceState> {
        self.users.get(user_id)
    }

    /// All users, ordered by user id.
    pub fn all_users(&self) -> Vec<&PresenceState> {
        let mut users: Vec<_> = self.users.values().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Color for a user, assigning the next palette entry on first sight.
    pub fn assign_color(&mut self, user_id: &UserId) -> String {
        if let Some(color) = self.color_assignments.get(user_id) {
            return color.clone();
        }
        let color = if self.available_colors.is_empty() {
            "#808080".to_string()
        } else {
            let color = self.available_colors[self.next_color_index % self.available_colors.len()].clone();
            self.next_color_index += 1;
            color
        };
        self.color_assignments.insert(user_id.clone(), color.clone());
        color
    }

    /// Shift every stored cursor through an accepted operation.
    pub fn transform_all(&mut self, op: &TextOperation) {
        for state in self.users.values_mut() {
            state.transform(op);
        }
    }
}

/// What changed after a presence update reached the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(UserId),
    Updated(UserId),
    /// The update was for the local user or otherwise ignored.
    Ignored,
}

#[derive(Clone, Debug)]
struct RemoteParticipant {
    state: PresenceState,
    typing_until: Option<Instant>,
}

/// Client-side view of remote participants.
///
/// Typing indicators decay locally: a participant shown as typing is cleared
/// once no presence update has refreshed it within the typing timeout, even
/// if no "stopped typing" message ever arrives.
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    local_user: UserId,
    typing_timeout: Duration,
    participants: HashMap<UserId, RemoteParticipant>,
}

impl PresenceTracker {
    pub fn new(local_user: UserId, typing_timeout: Duration) -> Self {
        Self {
            local_user,
            typing_timeout,
            participants: HashMap::new(),
        }
    }

    /// Record a full presence update received at `now`.
    pub fn update(&mut self, state: PresenceState, now: Instant) -> PresenceChange {
        if state.user_id == self.local_user {
            return PresenceChange::Ignored;
        }
        let user_id = state.user_id.clone();
        let typing_until = state.typing.then(|| now + self.typing_timeout);
        let previous = self.participants.insert(
            user_id.clone(),
            RemoteParticipant { state, typing_until },
        );
        match previous {
            Some(_) => PresenceChange::Updated(user_id),
            None => PresenceChange::Joined(user_id),
        }
    }

    /// Forget a participant after `user-leave`.
    pub fn remove(&mut self, user_id: &UserId) -> Option<PresenceState> {
        self.participants.remove(user_id).map(|p| p.state)
    }

    /// Clear typing flags whose timeout elapsed. Returns the affected users.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<UserId> {
        let mut expired = Vec::new();
        for participant in self.participants.values_mut() {
            if participant.typing_until.is_some_and(|deadline| deadline <= now) {
                participant.typing_until = None;
                participant.state.typing = false;
                expired.push(participant.state.user_id.clone());
            }
        }
        expired.sort();
        expired
    }

    /// Earliest pending typing expiry, for timer scheduling.
    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.participants.values().filter_map(|p| p.typing_until).min()
    }

    /// Shift remote cursors through an operation applied to the local document.
    pub fn transform_cursors(&mut self, op: &TextOperation) {
        for participant in self.participants.values_mut() {
            participant.state.transform(op);
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceState> {
        self.participants.get(user_id).map(|p| &p.state)
    }

    pub fn is_typing(&self, user_id: &UserId) -> bool {
        self.get(user_id).is_some_and(|s| s.typing)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    /// Remote carets for rendering, ordered by user id.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self
            .participants
            .values()
            .filter_map(|p| {
                let state = &p.state;
                let position = state.cursor.or_else(|| state.selection.map(|s| s.head))?;
                Some(RemoteCursor {
                    user_id: state.user_id.clone(),
                    display_name: state.display_name.clone(),
                    color: state.color.clone(),
                    position,
                    selection: state.selection.filter(|s| !s.is_collapsed()),
                    typing: state.typing,
                })
            })
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }
}

/// Default color palette for user cursors
pub fn default_colors() -> Vec<String> {
    vec![
        "#E91E63".into(), // Pink
        "#9C27B0".into(), // Purple
        "#3F51B5".into(), // Indigo
        "#2196F3".into(), // Blue
        "#00BCD4".into(), // Cyan
        "#4CAF50".into(), // Green
        "#FF9800".into(), // Orange
        "#795548".into(), // Brown
    ]
}
