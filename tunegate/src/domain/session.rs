//! Session entity and its state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Session lifecycle states.
///
/// Terminal states are [`SessionState::Stopped`], [`SessionState::Failed`]
/// and [`SessionState::Cancelled`]; a terminal session never leaves its
/// state and holds no tuner lease.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    Starting,
    Priming,
    Ready,
    Draining,
    Stopping,
    Stopped,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Cancelled)
    }

    /// States in which the session must hold a valid tuner lease and is
    /// therefore subject to lease expiry sweeping.
    pub const LEASED: &'static [SessionState] =
        &[Self::New, Self::Starting, Self::Priming, Self::Ready];

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (New, Starting) | (New, Cancelled) | (New, Failed) => true,
            (Starting, Priming) | (Starting, Failed) | (Starting, Cancelled) => true,
            (Starting, Stopping) => true,
            (Priming, Ready) | (Priming, Failed) | (Priming, Cancelled) | (Priming, Stopping) => {
                true
            }
            (Ready, Draining) | (Ready, Failed) | (Ready, Stopping) => true,
            // A missed heartbeat or abandoned recovery can fail a session
            // even while it is winding down.
            (Draining, Stopping) | (Draining, Failed) => true,
            (Stopping, Stopped) | (Stopping, Failed) => true,
            _ => false,
        }
    }
}

/// Why a session reached a terminal state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    UserStopped,
    LeaseExpired,
    PrimeTimeout,
    FfmpegCrashed,
    RecoveryAbandoned,
    Cancelled,
    Cleanup,
    Internal,
}

/// Durable session record, the unit stored in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub service_ref: String,
    pub profile_id: String,
    pub state: SessionState,
    pub tuner_slot: Option<u32>,
    /// Fencing epoch of the tuner lease, snapshotted at acquisition.
    pub lease_epoch: u64,
    pub hls_root: PathBuf,
    pub lease_expires_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub heartbeat_interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub stop_reason: Option<StopReason>,
    pub stop_requested_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
    /// Pid of the transcoder process, recorded for crash recovery.
    pub pid: Option<u32>,
    /// Bumped on every write; stale-epoch writes are rejected.
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a fresh session in `NEW` holding the given lease.
    ///
    /// The id is allocated by the caller because the lease is acquired
    /// under it before the record exists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        service_ref: impl Into<String>,
        profile_id: impl Into<String>,
        slot: u32,
        lease_epoch: u64,
        lease_expires_at: DateTime<Utc>,
        hls_base: &std::path::Path,
        heartbeat_interval_secs: u64,
        lease_ttl_secs: u64,
        correlation_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            service_ref: service_ref.into(),
            profile_id: profile_id.into(),
            state: SessionState::New,
            tuner_slot: Some(slot),
            lease_epoch,
            hls_root: hls_base.join(id.to_string()),
            lease_expires_at,
            last_heartbeat_at: now,
            heartbeat_interval_secs,
            lease_ttl_secs,
            stop_reason: None,
            stop_requested_at: None,
            correlation_id: correlation_id.into(),
            idempotency_key: None,
            pid: None,
            epoch: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state transition, rejecting anything outside the table.
    ///
    /// Terminal transitions clear the tuner slot; the lease itself is
    /// released by the caller through the arbiter.
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.tuner_slot = None;
        }
        Ok(())
    }

    /// Transition into a terminal state with the given reason.
    pub fn terminate(&mut self, to: SessionState, reason: StopReason) -> Result<()> {
        debug_assert!(to.is_terminal());
        self.transition(to)?;
        self.stop_reason = Some(reason);
        Ok(())
    }
}
