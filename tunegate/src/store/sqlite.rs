//! SQLite store backend, the production default.
//!
//! Session CAS is a guarded `UPDATE ... WHERE id = ? AND epoch = ?`; lease
//! operations are guarded single-statement updates, which makes them atomic
//! with respect to every concurrent caller. Timestamps are stored as
//! fixed-width RFC3339 UTC text so range predicates compare correctly.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use uuid::Uuid;

use super::retry::with_write_retries;
use super::{AcquiredLease, SessionMutation, SessionQuery, SessionStore, SessionVisitor, deadline};
use crate::domain::{LeaseRecord, SessionRecord, SessionState, StopReason};
use crate::{Error, Result};

const SESSION_COLUMNS: &str = "id, service_ref, profile_id, state, tuner_slot, lease_epoch, \
     hls_root, lease_expires_at, last_heartbeat_at, heartbeat_interval_secs, lease_ttl_secs, \
     stop_reason, stop_requested_at, correlation_id, idempotency_key, pid, epoch, created_at, \
     updated_at";

const TERMINAL_STATES: &str = "'STOPPED', 'FAILED', 'CANCELLED'";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy().replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // Commits must be durable before they are acknowledged.
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::storage(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(SessionRecord::try_from).transpose()
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp '{s}': {e}")))
}

/// Stored representation of a vacant lease deadline.
fn vacant_ts() -> String {
    ts(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    service_ref: String,
    profile_id: String,
    state: String,
    tuner_slot: Option<i64>,
    lease_epoch: i64,
    hls_root: String,
    lease_expires_at: String,
    last_heartbeat_at: String,
    heartbeat_interval_secs: i64,
    lease_ttl_secs: i64,
    stop_reason: Option<String>,
    stop_requested_at: Option<String>,
    correlation_id: String,
    idempotency_key: Option<String>,
    pid: Option<i64>,
    epoch: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SessionRecord {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| Error::storage(format!("bad session id '{}': {e}", row.id)))?,
            service_ref: row.service_ref,
            profile_id: row.profile_id,
            state: SessionState::from_str(&row.state)
                .map_err(|_| Error::storage(format!("unknown session state '{}'", row.state)))?,
            tuner_slot: row.tuner_slot.map(|s| s as u32),
            lease_epoch: row.lease_epoch as u64,
            hls_root: row.hls_root.into(),
            lease_expires_at: parse_ts(&row.lease_expires_at)?,
            last_heartbeat_at: parse_ts(&row.last_heartbeat_at)?,
            heartbeat_interval_secs: row.heartbeat_interval_secs as u64,
            lease_ttl_secs: row.lease_ttl_secs as u64,
            stop_reason: row
                .stop_reason
                .map(|r| {
                    StopReason::from_str(&r)
                        .map_err(|_| Error::storage(format!("unknown stop reason '{r}'")))
                })
                .transpose()?,
            stop_requested_at: row.stop_requested_at.as_deref().map(parse_ts).transpose()?,
            correlation_id: row.correlation_id,
            idempotency_key: row.idempotency_key,
            pid: row.pid.map(|p| p as u32),
            epoch: row.epoch as u64,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    slot: i64,
    holder: Option<String>,
    expires_at: String,
    epoch: i64,
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = Error;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(LeaseRecord {
            slot: row.slot as u32,
            holder: row
                .holder
                .map(|h| {
                    Uuid::parse_str(&h)
                        .map_err(|e| Error::storage(format!("bad lease holder '{h}': {e}")))
                })
                .transpose()?,
            expires_at: parse_ts(&row.expires_at)?,
            epoch: row.epoch as u64,
        })
    }
}

fn state_placeholders(states: &[SessionState]) -> String {
    std::iter::repeat_n("?", states.len())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        with_write_retries("put_session", || async {
            sqlx::query(&sql)
                .bind(session.id.to_string())
                .bind(&session.service_ref)
                .bind(&session.profile_id)
                .bind(session.state.to_string())
                .bind(session.tuner_slot.map(|s| s as i64))
                .bind(session.lease_epoch as i64)
                .bind(session.hls_root.to_string_lossy().to_string())
                .bind(ts(session.lease_expires_at))
                .bind(ts(session.last_heartbeat_at))
                .bind(session.heartbeat_interval_secs as i64)
                .bind(session.lease_ttl_secs as i64)
                .bind(session.stop_reason.map(|r| r.to_string()))
                .bind(session.stop_requested_at.map(ts))
                .bind(&session.correlation_id)
                .bind(&session.idempotency_key)
                .bind(session.pid.map(|p| p as i64))
                .bind(session.epoch as i64)
                .bind(ts(session.created_at))
                .bind(ts(session.updated_at))
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        self.fetch_session(id).await
    }

    async fn update_session_cas(
        &self,
        id: Uuid,
        expected_epoch: u64,
        mutate: SessionMutation<'_>,
    ) -> Result<SessionRecord> {
        with_write_retries("update_session_cas", || async {
            let current = self
                .fetch_session(id)
                .await?
                .ok_or_else(|| Error::not_found("Session", id.to_string()))?;
            if current.epoch != expected_epoch {
                return Err(Error::CasConflict {
                    entity_type: "Session",
                    id: id.to_string(),
                    expected: expected_epoch,
                });
            }

            let mut updated = current;
            mutate(&mut updated)?;
            updated.epoch = expected_epoch + 1;
            updated.updated_at = Utc::now();

            // The epoch guard makes this a compare-and-swap: if another
            // writer got in after the read, zero rows are affected.
            let result = sqlx::query(
                "UPDATE sessions SET \
                 state = ?, tuner_slot = ?, lease_epoch = ?, lease_expires_at = ?, \
                 last_heartbeat_at = ?, stop_reason = ?, stop_requested_at = ?, pid = ?, \
                 epoch = ?, updated_at = ? \
                 WHERE id = ? AND epoch = ?",
            )
            .bind(updated.state.to_string())
            .bind(updated.tuner_slot.map(|s| s as i64))
            .bind(updated.lease_epoch as i64)
            .bind(ts(updated.lease_expires_at))
            .bind(ts(updated.last_heartbeat_at))
            .bind(updated.stop_reason.map(|r| r.to_string()))
            .bind(updated.stop_requested_at.map(ts))
            .bind(updated.pid.map(|p| p as i64))
            .bind(updated.epoch as i64)
            .bind(ts(updated.updated_at))
            .bind(id.to_string())
            .bind(expected_epoch as i64)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(Error::CasConflict {
                    entity_type: "Session",
                    id: id.to_string(),
                    expected: expected_epoch,
                });
            }
            Ok(updated)
        })
        .await
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        with_write_retries("delete_session", || async {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>> {
        let mut conditions: Vec<String> = Vec::new();
        if let Some(states) = &query.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            conditions.push(format!("state IN ({})", state_placeholders(states)));
        }
        if query.lease_expires_before.is_some() {
            conditions.push("lease_expires_at < ?".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = match query.limit {
            Some(_) => "LIMIT ?",
            None => "",
        };
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {where_clause} \
             ORDER BY created_at ASC {limit_clause}"
        );

        let mut q = sqlx::query_as::<_, SessionRow>(&sql);
        if let Some(states) = &query.states {
            for state in states {
                q = q.bind(state.to_string());
            }
        }
        if let Some(bound) = query.lease_expires_before {
            q = q.bind(ts(bound));
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(SessionRecord::try_from).collect()
    }

    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()> {
        // Snapshot read; WAL keeps writers unblocked while we fetch.
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            visit(&SessionRecord::try_from(row)?);
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<SessionRecord>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE idempotency_key = ? AND state NOT IN ({TERMINAL_STATES}) \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SessionRecord::try_from).transpose()
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql =
            format!("DELETE FROM sessions WHERE state IN ({TERMINAL_STATES}) AND updated_at < ?");
        with_write_retries("prune_terminal_before", || async {
            let result = sqlx::query(&sql).bind(ts(cutoff)).execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn ensure_slots(&self, slots: &[u32]) -> Result<()> {
        for slot in slots {
            with_write_retries("ensure_slots", || async {
                sqlx::query(
                    "INSERT OR IGNORE INTO leases (slot, holder, expires_at, epoch) \
                     VALUES (?, NULL, ?, 0)",
                )
                .bind(*slot as i64)
                .bind(vacant_ts())
                .execute(&self.pool)
                .await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn get_lease(&self, slot: u32) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT slot, holder, expires_at, epoch FROM leases WHERE slot = ?",
        )
        .bind(slot as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            "SELECT slot, holder, expires_at, epoch FROM leases ORDER BY slot ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaseRecord::try_from).collect()
    }

    async fn acquire_lease(
        &self,
        session: Uuid,
        slots: &[u32],
        ttl: Duration,
    ) -> Result<Option<AcquiredLease>> {
        for slot in slots {
            let now = Utc::now();
            let expires_at = deadline(now, ttl);
            let claimed = with_write_retries("acquire_lease", || async {
                // Single guarded update: atomic claim of a vacant or
                // expired slot, losing cleanly to concurrent claimers.
                let result = sqlx::query(
                    "UPDATE leases SET holder = ?, expires_at = ?, epoch = epoch + 1 \
                     WHERE slot = ? AND (holder IS NULL OR expires_at <= ?)",
                )
                .bind(session.to_string())
                .bind(ts(expires_at))
                .bind(*slot as i64)
                .bind(ts(now))
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() == 1)
            })
            .await?;

            if claimed {
                let lease = self
                    .get_lease(*slot)
                    .await?
                    .ok_or_else(|| Error::internal(format!("lease row vanished for slot {slot}")))?;
                return Ok(Some(AcquiredLease {
                    slot: *slot,
                    epoch: lease.epoch,
                    expires_at,
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
        let expires_at = deadline(now, ttl);
        let extended = with_write_retries("extend_lease", || async {
            let result = sqlx::query(
                "UPDATE leases SET expires_at = ? \
                 WHERE slot = ? AND holder = ? AND epoch = ? AND expires_at > ?",
            )
            .bind(ts(expires_at))
            .bind(slot as i64)
            .bind(session.to_string())
            .bind(epoch as i64)
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        Ok(extended.then_some(expires_at))
    }

    async fn release_lease(&self, session: Uuid, slot: u32, epoch: u64) -> Result<()> {
        with_write_retries("release_lease", || async {
            sqlx::query(
                "UPDATE leases SET holder = NULL, expires_at = ? \
                 WHERE slot = ? AND holder = ? AND epoch = ?",
            )
            .bind(vacant_ts())
            .bind(slot as i64)
            .bind(session.to_string())
            .bind(epoch as i64)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionState;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(&dir.path().join("test.db")).await.unwrap()
    }

    fn record() -> SessionRecord {
        SessionRecord::new(
            Uuid::new_v4(),
            "1:0:1:445D:453:1:C00000:0:0:0:",
            "hls_720p",
            0,
            1,
            Utc::now() + chrono::Duration::seconds(15),
            std::path::Path::new("/tmp/hls"),
            5,
            15,
            "req-1",
        )
    }

    #[tokio::test]
    async fn session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let session = record().with_idempotency_key(Some("k".into()));
        store.put_session(&session).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.service_ref, session.service_ref);
        assert_eq!(loaded.state, SessionState::New);
        assert_eq!(loaded.tuner_slot, Some(0));
        assert_eq!(loaded.idempotency_key.as_deref(), Some("k"));
        assert_eq!(loaded.epoch, 0);
    }

    #[tokio::test]
    async fn cas_guard_rejects_stale_epoch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let session = record();
        store.put_session(&session).await.unwrap();

        store
            .update_session_cas(session.id, 0, &|s| s.transition(SessionState::Starting))
            .await
            .unwrap();
        let err = store
            .update_session_cas(session.id, 0, &|s| s.transition(SessionState::Priming))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CasConflict { .. }));
    }

    #[tokio::test]
    async fn expiry_query_filters_by_state_and_deadline() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut expired = record();
        expired.lease_expires_at = Utc::now() - chrono::Duration::seconds(5);
        store.put_session(&expired).await.unwrap();

        let live = record();
        store.put_session(&live).await.unwrap();

        let hits = store
            .query_sessions(
                &SessionQuery::default()
                    .with_states(SessionState::LEASED)
                    .with_lease_expires_before(Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, expired.id);
    }

    #[tokio::test]
    async fn lease_acquire_extend_release_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.ensure_slots(&[0, 1]).await.unwrap();

        let session = Uuid::new_v4();
        let ttl = Duration::from_secs(15);
        let acquired = store
            .acquire_lease(session, &[0, 1], ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acquired.slot, 0);
        assert_eq!(acquired.epoch, 1);

        let extended = store
            .extend_lease(session, 0, acquired.epoch, ttl)
            .await
            .unwrap();
        assert!(extended.is_some());

        // Wrong epoch is fenced out.
        assert!(
            store
                .extend_lease(session, 0, acquired.epoch + 1, ttl)
                .await
                .unwrap()
                .is_none()
        );

        store
            .release_lease(session, 0, acquired.epoch)
            .await
            .unwrap();
        let lease = store.get_lease(0).await.unwrap().unwrap();
        assert!(lease.holder.is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_sessions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let session = record();
        store.put_session(&session).await.unwrap();
        store
            .update_session_cas(session.id, 0, &|s| {
                s.terminate(SessionState::Cancelled, StopReason::Cancelled)
            })
            .await
            .unwrap();

        // Cutoff before the update: nothing pruned yet.
        let pruned = store
            .prune_terminal_before(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(pruned, 0);

        let pruned = store
            .prune_terminal_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_session(session.id).await.unwrap().is_none());
    }
}
