//! Tuner lease arbitration.
//!
//! The arbiter owns the configured slot set and hands out leases through
//! the store's atomic lease operations. Contention is fail-fast: when every
//! slot is held the caller gets [`AcquireOutcome::Busy`] immediately, there
//! is no queue. A background sweeper publishes `lease.lost` for sessions
//! whose deadline passed; the orchestrator performs the resulting state
//! transitions so the single-writer rule holds.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::domain::SessionState;
use crate::store::{AcquiredLease, SessionQuery, SessionStore};
use crate::Result;

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(AcquiredLease),
    /// Every configured slot is held; the client retries with backoff.
    Busy,
}

/// Result of a lease extension attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(DateTime<Utc>),
    /// The lease expired or was reassigned; terminal for the caller's view.
    Stale,
}

pub struct LeaseArbiter {
    store: Arc<dyn SessionStore>,
    slots: Vec<u32>,
}

impl LeaseArbiter {
    /// The slot set is fixed at startup and never changes at runtime.
    pub fn new(store: Arc<dyn SessionStore>, slots: Vec<u32>) -> Self {
        Self { store, slots }
    }

    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    /// Atomically grant the first vacant-or-expired slot to `session`.
    pub async fn try_acquire(&self, session: Uuid, ttl: Duration) -> Result<AcquireOutcome> {
        match self.store.acquire_lease(session, &self.slots, ttl).await? {
            Some(acquired) => {
                debug!(
                    session_id = %session,
                    tuner_slot = acquired.slot,
                    lease_epoch = acquired.epoch,
                    "lease acquired"
                );
                Ok(AcquireOutcome::Acquired(acquired))
            }
            None => Ok(AcquireOutcome::Busy),
        }
    }

    /// Push the deadline out iff `session` still holds `slot` at `epoch`.
    ///
    /// A former holder can never revive an expired or reassigned lease.
    pub async fn extend(
        &self,
        session: Uuid,
        slot: u32,
        epoch: u64,
        ttl: Duration,
    ) -> Result<ExtendOutcome> {
        match self.store.extend_lease(session, slot, epoch, ttl).await? {
            Some(expires_at) => Ok(ExtendOutcome::Extended(expires_at)),
            None => Ok(ExtendOutcome::Stale),
        }
    }

    /// Release the lease; a no-op when already released or reassigned.
    pub async fn release(&self, session: Uuid, slot: u32, epoch: u64) -> Result<()> {
        self.store.release_lease(session, slot, epoch).await
    }
}

/// Spawn the periodic expiry sweeper.
///
/// Each tick runs one indexed query for leased-state sessions whose
/// `lease_expires_at` has passed and publishes `lease.lost` for each hit.
pub fn spawn_expiry_sweeper(
    store: Arc<dyn SessionStore>,
    bus: EventBus,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("expiry sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    sweep_once(&store, &bus).await;
                }
            }
        }
    })
}

async fn sweep_once(store: &Arc<dyn SessionStore>, bus: &EventBus) {
    let query = SessionQuery::default()
        .with_states(SessionState::LEASED)
        .with_lease_expires_before(Utc::now());

    let expired = match store.query_sessions(&query).await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "expiry sweep query failed");
            return;
        }
    };

    for session in expired {
        warn!(
            session_id = %session.id,
            tuner_slot = ?session.tuner_slot,
            correlation_id = %session.correlation_id,
            "lease deadline passed, publishing lease.lost"
        );
        bus.publish(BusEvent::LeaseLost {
            session_id: session.id,
            slot: session.tuner_slot.unwrap_or_default(),
        });
    }
}
