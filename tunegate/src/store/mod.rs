//! Persistent state store.
//!
//! The store is the single source of truth for session and lease records.
//! Three backends share one contract: `memory` (tests, ephemeral), `sqlite`
//! (production default) and `redb`. Session writes are fenced by a
//! compare-and-swap on the record epoch; lease operations are linearizable
//! per slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::config::{StoreBackendKind, StoreConfig};
use crate::domain::{LeaseRecord, SessionRecord, SessionState};

pub mod memory;
pub mod redb;
pub mod retry;
pub mod sqlite;

pub use memory::MemoryStore;
pub use redb::RedbStore;
pub use sqlite::SqliteStore;

/// Mutation applied under the CAS guard of [`SessionStore::update_session_cas`].
pub type SessionMutation<'a> = &'a (dyn Fn(&mut SessionRecord) -> Result<()> + Send + Sync);

/// Callback for [`SessionStore::scan_sessions`].
pub type SessionVisitor<'a> = &'a mut (dyn FnMut(&SessionRecord) + Send);

/// Filtered session query.
///
/// The expiry sweeper issues `states + lease_expires_before` queries every
/// tick, so backends must answer that combination without a full scan.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub states: Option<Vec<SessionState>>,
    pub lease_expires_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl SessionQuery {
    pub fn with_states(mut self, states: &[SessionState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn with_lease_expires_before(mut self, bound: DateTime<Utc>) -> Self {
        self.lease_expires_before = Some(bound);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `session` matches this query.
    pub fn matches(&self, session: &SessionRecord) -> bool {
        if let Some(states) = &self.states
            && !states.contains(&session.state)
        {
            return false;
        }
        if let Some(bound) = self.lease_expires_before
            && session.lease_expires_at >= bound
        {
            return false;
        }
        true
    }
}

/// Outcome of a successful lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredLease {
    pub slot: u32,
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
}

/// The store contract shared by all backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session record. Fails if the id already exists.
    async fn put_session(&self, session: &SessionRecord) -> Result<()>;

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>>;

    /// Compare-and-swap update: applies `mutate` iff the stored epoch equals
    /// `expected_epoch`, bumps the epoch and returns the updated record.
    ///
    /// Returns [`crate::Error::CasConflict`] when the epoch moved, and
    /// propagates `mutate` errors without writing.
    async fn update_session_cas(
        &self,
        id: Uuid,
        expected_epoch: u64,
        mutate: SessionMutation<'_>,
    ) -> Result<SessionRecord>;

    async fn delete_session(&self, id: Uuid) -> Result<()>;

    /// Filtered query; `states + lease_expires_before` must be indexed.
    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>>;

    /// Visit every session for recovery.
    ///
    /// Backends must not hold a write-blocking lock across the callback;
    /// readers and writers proceed concurrently with the scan.
    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()>;

    /// Find the non-terminal session created with `key`, if any.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<SessionRecord>>;

    /// Delete terminal sessions last updated before `cutoff`; returns the count.
    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Seed vacant lease records for the configured slots.
    async fn ensure_slots(&self, slots: &[u32]) -> Result<()>;

    async fn get_lease(&self, slot: u32) -> Result<Option<LeaseRecord>>;

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>>;

    /// Atomically grant the first vacant-or-expired slot (in `slots` order)
    /// to `session` for `ttl`. Returns `None` when every slot is held.
    ///
    /// The scan-and-commit is a single atomic step with respect to all other
    /// lease operations.
    async fn acquire_lease(
        &self,
        session: Uuid,
        slots: &[u32],
        ttl: Duration,
    ) -> Result<Option<AcquiredLease>>;

    /// Push the lease deadline out iff `session` still holds `slot` at
    /// `epoch`. Returns the new deadline, or `None` when the lease is stale.
    async fn extend_lease(
        &self,
        session: Uuid,
        slot: u32,
        epoch: u64,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Clear the holder iff it matches; a no-op when already released.
    async fn release_lease(&self, session: Uuid, slot: u32, epoch: u64) -> Result<()>;
}

/// Open the configured backend and seed lease records for `slots`.
pub async fn open_store(cfg: &StoreConfig, slots: &[u32]) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match cfg.backend {
        StoreBackendKind::Memory => Arc::new(MemoryStore::new()),
        StoreBackendKind::Sqlite => Arc::new(SqliteStore::open(&cfg.path).await?),
        StoreBackendKind::Redb => Arc::new(RedbStore::open(&cfg.path)?),
    };
    store.ensure_slots(slots).await?;
    Ok(store)
}

/// Lease TTL applied to a deadline.
pub(crate) fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0))
}
