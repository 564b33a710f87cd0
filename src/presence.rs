//! Active-user roster for one document session.
//!
//! Purely reactive: the sync session is the sole writer, feeding it from join
//! responses and presence messages on the subscription stream. The roster has
//! no independent source of truth.

use chrono::Utc;

use crate::protocol::{ActiveUser, PresenceUpdate};

/// Roster of users active in a session, ordered by join.
///
/// Entries are keyed by user id with last-write-wins updates; an upsert for a
/// known user refreshes the entry in place without changing its join order.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    users: Vec<ActiveUser>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster, e.g. from a join response or a
    /// GetActiveUsers refresh.
    pub fn reset(&mut self, users: Vec<ActiveUser>) {
        self.users = users;
    }

    /// Insert or refresh one user (last write wins).
    pub fn upsert(&mut self, user: ActiveUser) {
        match self.users.iter_mut().find(|u| u.user_id == user.user_id) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }

    /// Remove a user named by a leave/disconnect notification. Unknown ids
    /// are ignored.
    pub fn remove(&mut self, user_id: &str) {
        self.users.retain(|u| u.user_id != user_id);
    }

    /// Apply a pushed roster-changed message.
    pub fn apply(&mut self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::Join { user } => self.upsert(user),
            PresenceUpdate::Leave { user_id } => self.remove(&user_id),
            PresenceUpdate::Cursor {
                user_id,
                cursor_position,
            } => {
                if let Some(user) = self.users.iter_mut().find(|u| u.user_id == user_id) {
                    user.cursor_position = cursor_position;
                    user.last_active = Utc::now();
                }
            }
        }
    }

    /// Active users in join order.
    pub fn list(&self) -> &[ActiveUser] {
        &self.users
    }

    pub fn get(&self, user_id: &str) -> Option<&ActiveUser> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
