//! Tuner lease entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable lease record for a single tuner slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub slot: u32,
    pub holder: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    /// Bumped on every acquisition; stale extends/releases are fenced out.
    pub epoch: u64,
}

impl LeaseRecord {
    /// An unheld lease for `slot`, as seeded at startup.
    pub fn vacant(slot: u32) -> Self {
        Self {
            slot,
            holder: None,
            expires_at: DateTime::<Utc>::MIN_UTC,
            epoch: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `session` currently holds this lease (unexpired).
    pub fn is_held_by(&self, session: Uuid, now: DateTime<Utc>) -> bool {
        self.holder == Some(session) && !self.is_expired(now)
    }

    /// Whether the slot can be handed to a new holder.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.holder.is_none() || self.is_expired(now)
    }
}
