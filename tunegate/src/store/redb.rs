//! redb store backend.
//!
//! Records are serde_json values in two tables; a third table indexes
//! leased-state sessions by lease deadline so the expiry sweeper query does
//! not scan the whole session table. redb write transactions are serialized,
//! which gives the CAS and lease operations their atomicity; commits are
//! durable before they return.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::{AcquiredLease, SessionMutation, SessionQuery, SessionStore, SessionVisitor, deadline};
use crate::domain::{LeaseRecord, SessionRecord, SessionState};
use crate::{Error, Result};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const LEASES: TableDefinition<u32, &[u8]> = TableDefinition::new("leases");
/// (lease deadline in micros, session id) for sessions in a leased state.
const LEASE_EXPIRY: TableDefinition<(i64, &str), ()> = TableDefinition::new("lease_expiry");

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (creating if missing) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        // Create all tables up front so readers never race table creation.
        let txn = db.begin_write()?;
        {
            txn.open_table(SESSIONS)?;
            txn.open_table(LEASES)?;
            txn.open_table(LEASE_EXPIRY)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_session(bytes: &[u8]) -> Result<SessionRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_lease(bytes: &[u8]) -> Result<LeaseRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

fn expiry_key(session: &SessionRecord) -> Option<(i64, String)> {
    SessionState::LEASED
        .contains(&session.state)
        .then(|| (session.lease_expires_at.timestamp_micros(), session.id.to_string()))
}

/// Maintain the expiry index across a session write, inside the caller's txn.
fn reindex(
    index: &mut redb::Table<'_, (i64, &str), ()>,
    old: Option<&SessionRecord>,
    new: Option<&SessionRecord>,
) -> Result<()> {
    if let Some(key) = old.and_then(expiry_key) {
        index.remove((key.0, key.1.as_str()))?;
    }
    if let Some(key) = new.and_then(expiry_key) {
        index.insert((key.0, key.1.as_str()), ())?;
    }
    Ok(())
}

#[async_trait]
impl SessionStore for RedbStore {
    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SESSIONS)?;
            let key = session.id.to_string();
            if table.get(key.as_str())?.is_some() {
                return Err(Error::internal(format!(
                    "session {} already exists",
                    session.id
                )));
            }
            table.insert(key.as_str(), encode(session)?.as_slice())?;
            let mut index = txn.open_table(LEASE_EXPIRY)?;
            reindex(&mut index, None, Some(session))?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        let Some(guard) = table.get(id.to_string().as_str())? else {
            return Ok(None);
        };
        Ok(Some(decode_session(guard.value())?))
    }

    async fn update_session_cas(
        &self,
        id: Uuid,
        expected_epoch: u64,
        mutate: SessionMutation<'_>,
    ) -> Result<SessionRecord> {
        let txn = self.db.begin_write()?;
        let updated = {
            let mut table = txn.open_table(SESSIONS)?;
            let key = id.to_string();
            let current = {
                let Some(guard) = table.get(key.as_str())? else {
                    return Err(Error::not_found("Session", key));
                };
                decode_session(guard.value())?
            };
            if current.epoch != expected_epoch {
                return Err(Error::CasConflict {
                    entity_type: "Session",
                    id: key,
                    expected: expected_epoch,
                });
            }

            let mut updated = current.clone();
            mutate(&mut updated)?;
            updated.epoch = expected_epoch + 1;
            updated.updated_at = Utc::now();

            table.insert(key.as_str(), encode(&updated)?.as_slice())?;
            let mut index = txn.open_table(LEASE_EXPIRY)?;
            reindex(&mut index, Some(&current), Some(&updated))?;
            updated
        };
        txn.commit()?;
        Ok(updated)
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SESSIONS)?;
            let key = id.to_string();
            let old = table
                .remove(key.as_str())?
                .map(|guard| decode_session(guard.value()))
                .transpose()?;
            if let Some(old) = old {
                let mut index = txn.open_table(LEASE_EXPIRY)?;
                reindex(&mut index, Some(&old), None)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>> {
        let txn = self.db.begin_read()?;
        let sessions = txn.open_table(SESSIONS)?;

        // The sweeper's states ⊆ leased-states + deadline query is served
        // from the expiry index instead of a full scan.
        let indexed = query.lease_expires_before.is_some()
            && query
                .states
                .as_ref()
                .is_some_and(|s| s.iter().all(|st| SessionState::LEASED.contains(st)));

        let mut out: Vec<SessionRecord> = Vec::new();
        if indexed {
            let bound = query
                .lease_expires_before
                .expect("checked above")
                .timestamp_micros();
            let index = txn.open_table(LEASE_EXPIRY)?;
            for entry in index.range((i64::MIN, "")..(bound, ""))? {
                let (key, _) = entry?;
                let (_, id) = key.value();
                if let Some(guard) = sessions.get(id)? {
                    let session = decode_session(guard.value())?;
                    if query.matches(&session) {
                        out.push(session);
                    }
                }
            }
        } else {
            for entry in sessions.iter()? {
                let (_, value) = entry?;
                let session = decode_session(value.value())?;
                if query.matches(&session) {
                    out.push(session);
                }
            }
        }

        out.sort_by_key(|s| s.created_at);
        if let Some(limit) = query.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()> {
        // Read transactions are MVCC snapshots; writers are not blocked
        // while the callback runs.
        let snapshot: Vec<SessionRecord> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(SESSIONS)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                out.push(decode_session(value.value())?);
            }
            out
        };
        for session in &snapshot {
            visit(session);
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<SessionRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let session = decode_session(value.value())?;
            if !session.is_terminal() && session.idempotency_key.as_deref() == Some(key) {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let pruned = {
            let mut table = txn.open_table(SESSIONS)?;
            let doomed: Vec<String> = {
                let mut doomed = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    let session = decode_session(value.value())?;
                    if session.is_terminal() && session.updated_at < cutoff {
                        doomed.push(key.value().to_string());
                    }
                }
                doomed
            };
            for key in &doomed {
                table.remove(key.as_str())?;
            }
            doomed.len() as u64
        };
        txn.commit()?;
        Ok(pruned)
    }

    async fn ensure_slots(&self, slots: &[u32]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LEASES)?;
            for slot in slots {
                if table.get(*slot)?.is_none() {
                    table.insert(*slot, encode(&LeaseRecord::vacant(*slot))?.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn get_lease(&self, slot: u32) -> Result<Option<LeaseRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LEASES)?;
        let Some(guard) = table.get(slot)? else {
            return Ok(None);
        };
        Ok(Some(decode_lease(guard.value())?))
    }

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LEASES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(decode_lease(value.value())?);
        }
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
        let txn = self.db.begin_write()?;
        let acquired = {
            let mut table = txn.open_table(LEASES)?;
            let mut acquired = None;
            for slot in slots {
                let Some(mut lease) = table
                    .get(*slot)?
                    .map(|guard| decode_lease(guard.value()))
                    .transpose()?
                else {
                    continue;
                };
                if lease.is_acquirable(now) {
                    lease.holder = Some(session);
                    lease.expires_at = deadline(now, ttl);
                    lease.epoch += 1;
                    table.insert(*slot, encode(&lease)?.as_slice())?;
                    acquired = Some(AcquiredLease {
                        slot: *slot,
                        epoch: lease.epoch,
                        expires_at: lease.expires_at,
                    });
                    break;
                }
            }
            acquired
        };
        txn.commit()?;
        Ok(acquired)
    }

    async fn extend_lease(
        &self,
        session: Uuid,
        slot: u32,
        epoch: u64,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let mut extended = None;
        {
            let mut table = txn.open_table(LEASES)?;
            let lease = table
                .get(slot)?
                .map(|guard| decode_lease(guard.value()))
                .transpose()?;
            if let Some(mut lease) = lease
                && lease.holder == Some(session)
                && lease.epoch == epoch
                && !lease.is_expired(now)
            {
                lease.expires_at = deadline(now, ttl);
                table.insert(slot, encode(&lease)?.as_slice())?;
                extended = Some(lease.expires_at);
            }
        }
        txn.commit()?;
        Ok(extended)
    }

    async fn release_lease(&self, session: Uuid, slot: u32, epoch: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LEASES)?;
            let lease = table
                .get(slot)?
                .map(|guard| decode_lease(guard.value()))
                .transpose()?;
            if let Some(mut lease) = lease
                && lease.holder == Some(session)
                && lease.epoch == epoch
            {
                lease.holder = None;
                lease.expires_at = DateTime::<Utc>::MIN_UTC;
                table.insert(slot, encode(&lease)?.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}
