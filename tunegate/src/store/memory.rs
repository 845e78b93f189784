//! In-memory store backend.
//!
//! Used by tests and ephemeral deployments. Lease operations run under a
//! single mutex so the scan-and-commit of an acquisition is one atomic step.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{AcquiredLease, SessionMutation, SessionQuery, SessionStore, SessionVisitor, deadline};
use crate::domain::{LeaseRecord, SessionRecord};
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
    leases: Mutex<HashMap<u32, LeaseRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(Error::internal(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn update_session_cas(
        &self,
        id: Uuid,
        expected_epoch: u64,
        mutate: SessionMutation<'_>,
    ) -> Result<SessionRecord> {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get(&id)
            .ok_or_else(|| Error::not_found("Session", id.to_string()))?;
        if current.epoch != expected_epoch {
            return Err(Error::CasConflict {
                entity_type: "Session",
                id: id.to_string(),
                expected: expected_epoch,
            });
        }
        let mut updated = current.clone();
        mutate(&mut updated)?;
        updated.epoch = expected_epoch + 1;
        updated.updated_at = Utc::now();
        sessions.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        self.sessions.write().remove(&id);
        Ok(())
    }

    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read();
        let mut out: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        if let Some(limit) = query.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()> {
        // Snapshot under the read lock, release it, then visit.
        let snapshot: Vec<SessionRecord> = self.sessions.read().values().cloned().collect();
        for session in &snapshot {
            visit(session);
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| !s.is_terminal() && s.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !(s.is_terminal() && s.updated_at < cutoff));
        Ok((before - sessions.len()) as u64)
    }

    async fn ensure_slots(&self, slots: &[u32]) -> Result<()> {
        let mut leases = self.leases.lock();
        for slot in slots {
            leases
                .entry(*slot)
                .or_insert_with(|| LeaseRecord::vacant(*slot));
        }
        Ok(())
    }

    async fn get_lease(&self, slot: u32) -> Result<Option<LeaseRecord>> {
        Ok(self.leases.lock().get(&slot).cloned())
    }

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let mut out: Vec<LeaseRecord> = self.leases.lock().values().cloned().collect();
        out.sort_by_key(|l| l.slot);
        Ok(out)
    }

    async fn acquire_lease(
        &self,
        session: Uuid,
        slots: &[u32],
        ttl: Duration,
    ) -> Result<Option<AcquiredLease>> {
        let now = Utc::now();
        let mut leases = self.leases.lock();
        for slot in slots {
            let Some(lease) = leases.get_mut(slot) else {
                continue;
            };
            if lease.is_acquirable(now) {
                lease.holder = Some(session);
                lease.expires_at = deadline(now, ttl);
                lease.epoch += 1;
                return Ok(Some(AcquiredLease {
                    slot: *slot,
                    epoch: lease.epoch,
                    expires_at: lease.expires_at,
                }));
            }
        }
        Ok(None)
    }

    async fn extend_lease(
        &self,
        session: Uuid,
        slot: u32,
        epoch: u64,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let mut leases = self.leases.lock();
        let Some(lease) = leases.get_mut(&slot) else {
            return Ok(None);
        };
        if lease.holder != Some(session) || lease.epoch != epoch || lease.is_expired(now) {
            return Ok(None);
        }
        lease.expires_at = deadline(now, ttl);
        Ok(Some(lease.expires_at))
    }

    async fn release_lease(&self, session: Uuid, slot: u32, epoch: u64) -> Result<()> {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get_mut(&slot)
            && lease.holder == Some(session)
            && lease.epoch == epoch
        {
            lease.holder = None;
            lease.expires_at = DateTime::<Utc>::MIN_UTC;
        }
        Ok(())
    }
}
