//! Intent admission and the session resource operations.
//!
//! Admission is lease-first: the tuner slot is acquired under the new
//! session id before the record is written, so a caller sees exactly
//! "accepted" or "busy" and nothing in between. Idempotency-key lookups and
//! the acquire-then-put sequence run under one admission lock so concurrent
//! duplicate intents converge on a single record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::config::SessionConfig;
use crate::domain::SessionRecord;
use crate::lease::{AcquireOutcome, ExtendOutcome, LeaseArbiter};
use crate::pipeline::ProfileRegistry;
use crate::store::{SessionQuery, SessionStore};
use crate::{Error, Result};

/// A validated "play this channel" intent.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub service_ref: String,
    pub profile_id: String,
    pub idempotency_key: Option<String>,
}

/// Result of intent admission.
#[derive(Debug, Clone, Copy)]
pub struct CreateOutcome {
    pub session_id: Uuid,
    /// True when an idempotency key matched an existing live session.
    pub reused: bool,
}

pub struct IntentService {
    store: Arc<dyn SessionStore>,
    arbiter: Arc<LeaseArbiter>,
    bus: EventBus,
    profiles: Arc<ProfileRegistry>,
    session_cfg: SessionConfig,
    hls_root: PathBuf,
    admission: Mutex<()>,
}

impl IntentService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        arbiter: Arc<LeaseArbiter>,
        bus: EventBus,
        profiles: Arc<ProfileRegistry>,
        session_cfg: SessionConfig,
        hls_root: PathBuf,
    ) -> Self {
        Self {
            store,
            arbiter,
            bus,
            profiles,
            session_cfg,
            hls_root,
            admission: Mutex::new(()),
        }
    }

    /// Admit an intent: acquire a lease, write the NEW record, publish
    /// `session.start`.
    pub async fn create(&self, intent: CreateIntent, correlation_id: &str) -> Result<CreateOutcome> {
        validate_service_ref(&intent.service_ref)?;
        if !self.profiles.contains(&intent.profile_id) {
            return Err(Error::validation(format!(
                "unknown profileID '{}' (known: {})",
                intent.profile_id,
                self.profiles.ids().join(", ")
            )));
        }

        let _admission = self.admission.lock().await;

        if let Some(key) = intent.idempotency_key.as_deref()
            && let Some(existing) = self.store.find_by_idempotency_key(key).await?
        {
            debug!(
                session_id = %existing.id,
                idempotency_key = key,
                "idempotent intent matched existing session"
            );
            return Ok(CreateOutcome {
                session_id: existing.id,
                reused: true,
            });
        }

        let session_id = Uuid::new_v4();
        let lease = match self
            .arbiter
            .try_acquire(session_id, self.session_cfg.lease_ttl())
            .await?
        {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Busy => return Err(Error::TunerBusy),
        };

        let session = SessionRecord::new(
            session_id,
            intent.service_ref,
            intent.profile_id,
            lease.slot,
            lease.epoch,
            lease.expires_at,
            &self.hls_root,
            self.session_cfg.heartbeat_interval_secs,
            self.session_cfg.lease_ttl_secs,
            correlation_id,
        )
        .with_idempotency_key(intent.idempotency_key);

        if let Err(e) = self.store.put_session(&session).await {
            // Don't strand the slot behind a failed write.
            if let Err(release_err) = self
                .arbiter
                .release(session_id, lease.slot, lease.epoch)
                .await
            {
                warn!(
                    session_id = %session_id,
                    error = %release_err,
                    "lease release after failed admission also failed"
                );
            }
            return Err(e);
        }

        self.bus.publish(BusEvent::SessionStart { session_id });
        info!(
            session_id = %session_id,
            tuner_slot = lease.slot,
            correlation_id,
            service_ref = %session.service_ref,
            profile_id = %session.profile_id,
            "session admitted"
        );
        Ok(CreateOutcome {
            session_id,
            reused: false,
        })
    }

    /// Extend the session's lease using the TTL snapshotted at creation.
    ///
    /// Returns the new deadline, or [`Error::LeaseExpired`] when the lease
    /// is stale or the session is terminal; the client must stop playback
    /// and obtain a new session.
    pub async fn heartbeat(&self, id: Uuid) -> Result<DateTime<Utc>> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| Error::not_found("Session", id.to_string()))?;
        if session.is_terminal() {
            return Err(Error::LeaseExpired);
        }
        let Some(slot) = session.tuner_slot else {
            return Err(Error::LeaseExpired);
        };

        let ttl = Duration::from_secs(session.lease_ttl_secs);
        let expires_at = match self
            .arbiter
            .extend(id, slot, session.lease_epoch, ttl)
            .await?
        {
            ExtendOutcome::Extended(expires_at) => expires_at,
            ExtendOutcome::Stale => return Err(Error::LeaseExpired),
        };

        // Reflect the extension in the session record. Conflicts with the
        // worker's own writes are benign; retry against the fresh epoch.
        for _ in 0..5 {
            let current = self
                .store
                .get_session(id)
                .await?
                .ok_or_else(|| Error::not_found("Session", id.to_string()))?;
            if current.is_terminal() {
                return Err(Error::LeaseExpired);
            }
            match self
                .store
                .update_session_cas(id, current.epoch, &move |s| {
                    s.lease_expires_at = expires_at;
                    s.last_heartbeat_at = Utc::now();
                    Ok(())
                })
                .await
            {
                Ok(_) => return Ok(expires_at),
                Err(Error::CasConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        // The lease itself was extended; losing the metadata race is not
        // worth failing the heartbeat over.
        Ok(expires_at)
    }

    /// Record the stop intent and publish `session.stop`. Idempotent.
    pub async fn stop(&self, id: Uuid) -> Result<()> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| Error::not_found("Session", id.to_string()))?;

        if !session.is_terminal() && session.stop_requested_at.is_none() {
            for _ in 0..5 {
                let current = self
                    .store
                    .get_session(id)
                    .await?
                    .ok_or_else(|| Error::not_found("Session", id.to_string()))?;
                if current.is_terminal() || current.stop_requested_at.is_some() {
                    break;
                }
                match self
                    .store
                    .update_session_cas(id, current.epoch, &|s| {
                        s.stop_requested_at = Some(Utc::now());
                        Ok(())
                    })
                    .await
                {
                    Ok(_) => break,
                    Err(Error::CasConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        self.bus.publish(BusEvent::SessionStop { session_id: id });
        debug!(session_id = %id, "stop requested");
        Ok(())
    }

    /// Point read for `GET /sessions/{id}`.
    pub async fn get(&self, id: Uuid) -> Result<SessionRecord> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| Error::not_found("Session", id.to_string()))
    }

    /// Operator listing, newest-bounded.
    pub async fn list(&self, limit: u32) -> Result<Vec<SessionRecord>> {
        self.store
            .query_sessions(&SessionQuery::default().with_limit(limit))
            .await
    }
}

fn validate_service_ref(service_ref: &str) -> Result<()> {
    let trimmed = service_ref.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("serviceRef must not be empty"));
    }
    if !trimmed.contains(':') {
        return Err(Error::validation(
            "serviceRef must be a colon-delimited Enigma2 service reference",
        ));
    }
    if trimmed.len() > 512 {
        return Err(Error::validation("serviceRef is too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::topic;
    use crate::domain::SessionState;
    use crate::store::MemoryStore;

    async fn service(slots: &[u32]) -> IntentService {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        store.ensure_slots(slots).await.unwrap();
        let arbiter = Arc::new(LeaseArbiter::new(store.clone(), slots.to_vec()));
        IntentService::new(
            store,
            arbiter,
            EventBus::new(),
            Arc::new(ProfileRegistry::builtin()),
            SessionConfig::default(),
            PathBuf::from("/tmp/tunegate-test-hls"),
        )
    }

    fn intent() -> CreateIntent {
        CreateIntent {
            service_ref: "1:0:1:445D:453:1:C00000:0:0:0:".into(),
            profile_id: "hls_720p".into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn admission_creates_a_new_session_holding_a_lease() {
        let svc = service(&[0]).await;
        let mut rx = svc.bus.subscribe(topic::SESSION_START);

        let outcome = svc.create(intent(), "req-1").await.unwrap();
        assert!(!outcome.reused);

        let session = svc.get(outcome.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::New);
        assert_eq!(session.tuner_slot, Some(0));
        assert_eq!(session.correlation_id, "req-1");
        assert_eq!(session.lease_ttl_secs, 15);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id(), outcome.session_id);
    }

    #[tokio::test]
    async fn second_intent_on_single_slot_is_busy() {
        let svc = service(&[0]).await;
        svc.create(intent(), "req-1").await.unwrap();
        let err = svc.create(intent(), "req-2").await.unwrap_err();
        assert!(matches!(err, Error::TunerBusy));
    }

    #[tokio::test]
    async fn idempotency_key_returns_the_same_session() {
        let svc = service(&[0]).await;
        let mut with_key = intent();
        with_key.idempotency_key = Some("replay-1".into());

        let first = svc.create(with_key.clone(), "req-1").await.unwrap();
        let second = svc.create(with_key, "req-2").await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert!(second.reused);

        // Exactly one record, one lease holder.
        assert_eq!(svc.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected_before_admission() {
        let svc = service(&[0]).await;
        let mut bad = intent();
        bad.profile_id = "hls_8k".into();
        let err = svc.create(bad, "req-1").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // The slot is untouched.
        assert!(matches!(
            svc.create(intent(), "req-2").await.unwrap(),
            CreateOutcome { reused: false, .. }
        ));
    }

    #[tokio::test]
    async fn malformed_service_ref_is_rejected() {
        let svc = service(&[0]).await;
        for bad_ref in ["", "   ", "no-colons-here"] {
            let mut bad = intent();
            bad.service_ref = bad_ref.into();
            assert!(matches!(
                svc.create(bad, "req-1").await.unwrap_err(),
                Error::Validation(_)
            ));
        }
    }

    #[tokio::test]
    async fn heartbeat_extends_then_goes_stale_after_expiry() {
        let svc = service(&[0]).await;
        let outcome = svc.create(intent(), "req-1").await.unwrap();

        let first = svc.heartbeat(outcome.session_id).await.unwrap();
        assert!(first > Utc::now());

        // Force the lease past its deadline, then heartbeat again.
        let session = svc.get(outcome.session_id).await.unwrap();
        let slot = session.tuner_slot.unwrap();
        let stale = svc
            .arbiter
            .extend(
                outcome.session_id,
                slot,
                session.lease_epoch,
                Duration::from_millis(0),
            )
            .await
            .unwrap();
        assert!(matches!(stale, ExtendOutcome::Extended(_)));

        let err = svc.heartbeat(outcome.session_id).await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_publishes() {
        let svc = service(&[0]).await;
        let mut rx = svc.bus.subscribe(topic::SESSION_STOP);
        let outcome = svc.create(intent(), "req-1").await.unwrap();

        svc.stop(outcome.session_id).await.unwrap();
        svc.stop(outcome.session_id).await.unwrap();

        let session = svc.get(outcome.session_id).await.unwrap();
        assert!(session.stop_requested_at.is_some());
        assert_eq!(rx.try_recv().unwrap().session_id(), outcome.session_id);
        assert_eq!(rx.try_recv().unwrap().session_id(), outcome.session_id);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_session_is_not_found() {
        let svc = service(&[0]).await;
        let err = svc.heartbeat(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
