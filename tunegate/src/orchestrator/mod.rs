//! Session orchestration.
//!
//! The orchestrator turns `session.start` intents into per-session worker
//! tasks, routes stop and lease-loss signals to them, recovers in-flight
//! sessions after a restart (before the bus is serviced), and prunes
//! terminal records past the retention window. Apart from the expiry
//! sweeper's `lease.lost` publications, every session mutation funnels
//! through exactly one worker.

pub mod playability;
pub mod worker;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, topic};
use crate::config::SessionConfig;
use crate::domain::{SessionRecord, SessionState, StopReason};
use crate::lease::LeaseArbiter;
use crate::pipeline::{ProfileRegistry, Transcoder, pid_alive};
use crate::store::{SessionQuery, SessionStore};
use crate::{Error, Result};
use enigma2::Enigma2Client;
pub use worker::WorkerCommand;
use worker::SessionWorker;

/// Everything a session worker needs, shared across workers.
pub(crate) struct WorkerDeps {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) arbiter: Arc<LeaseArbiter>,
    pub(crate) bus: EventBus,
    pub(crate) receiver: Enigma2Client,
    pub(crate) transcoder: Transcoder,
    pub(crate) profiles: Arc<ProfileRegistry>,
    pub(crate) session_cfg: SessionConfig,
    pub(crate) tune_timeout: Duration,
}

/// Outcome of the startup recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub resumed: usize,
    pub abandoned: usize,
}

pub struct Orchestrator {
    deps: Arc<WorkerDeps>,
    workers: DashMap<Uuid, mpsc::Sender<WorkerCommand>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        arbiter: Arc<LeaseArbiter>,
        bus: EventBus,
        receiver: Enigma2Client,
        transcoder: Transcoder,
        profiles: Arc<ProfileRegistry>,
        session_cfg: SessionConfig,
        tune_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps: Arc::new(WorkerDeps {
                store,
                arbiter,
                bus,
                receiver,
                transcoder,
                profiles,
                session_cfg,
                tune_timeout,
            }),
            workers: DashMap::new(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            cancel,
        })
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Resume or abandon every non-terminal session found in the store.
    ///
    /// Runs before the bus dispatcher starts so recovery cannot race fresh
    /// intents. A session is resumed only when its lease is still valid and
    /// held by this same session AND its recorded transcoder pid is alive;
    /// everything else is failed with `RECOVERY_ABANDONED` and its lease
    /// released.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoverySummary> {
        let mut candidates: Vec<SessionRecord> = Vec::new();
        self.deps
            .store
            .scan_sessions(&mut |s| {
                if !s.is_terminal() {
                    candidates.push(s.clone());
                }
            })
            .await?;

        let now = Utc::now();
        let mut summary = RecoverySummary::default();
        for session in candidates {
            let lease_ok = match session.tuner_slot {
                Some(slot) => self
                    .deps
                    .store
                    .get_lease(slot)
                    .await?
                    .map(|l| l.is_held_by(session.id, now) && l.epoch == session.lease_epoch)
                    .unwrap_or(false),
                None => false,
            };
            let process_ok = session.pid.map(pid_alive).unwrap_or(false);

            if lease_ok && process_ok {
                info!(
                    session_id = %session.id,
                    state = %session.state,
                    pid = ?session.pid,
                    "resuming session after restart"
                );
                self.spawn_worker(session).await;
                summary.resumed += 1;
            } else {
                self.abandon_session(session).await;
                summary.abandoned += 1;
            }
        }

        info!(
            resumed = summary.resumed,
            abandoned = summary.abandoned,
            "recovery scan complete"
        );
        Ok(summary)
    }

    /// Start the bus dispatcher and the retention prune task.
    pub fn start(self: &Arc<Self>) {
        let mut start_rx = self.deps.bus.subscribe(topic::SESSION_START);
        let mut stop_rx = self.deps.bus.subscribe(topic::SESSION_STOP);
        let mut lost_rx = self.deps.bus.subscribe(topic::LEASE_LOST);

        let orch = self.clone();
        tokio::spawn(async move {
            // Bus delivery is best-effort; the catch-up tick re-reads the
            // store for NEW sessions whose start event was dropped.
            let mut catchup =
                tokio::time::interval(orch.deps.session_cfg.expiry_check_interval());
            catchup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = orch.cancel.cancelled() => {
                        debug!("orchestrator dispatcher shutting down");
                        break;
                    }
                    Some(event) = start_rx.recv() => {
                        orch.handle_session_start(event.session_id()).await;
                    }
                    Some(event) = stop_rx.recv() => {
                        orch.handle_session_stop(event.session_id()).await;
                    }
                    Some(event) = lost_rx.recv() => {
                        orch.handle_lease_lost(event.session_id()).await;
                    }
                    _ = catchup.tick() => {
                        orch.catch_up_new_sessions().await;
                    }
                    else => break,
                }
            }
        });

        let orch = self.clone();
        tokio::spawn(async move {
            let retention = orch.deps.session_cfg.retention();
            let interval = (retention / 2).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = orch.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(retention)
                                .unwrap_or_else(|_| chrono::Duration::seconds(900));
                        match orch.deps.store.prune_terminal_before(cutoff).await {
                            Ok(0) => {}
                            Ok(pruned) => debug!(pruned, "pruned terminal sessions"),
                            Err(e) => warn!(error = %e, "terminal session prune failed"),
                        }
                    }
                }
            }
        });
    }

    /// Drain all workers within `deadline`, aborting stragglers.
    pub async fn shutdown(&self, deadline: Duration) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown deadline exceeded, aborting remaining session workers");
            tasks.abort_all();
        }
    }

    async fn handle_session_start(self: &Arc<Self>, id: Uuid) {
        if self.workers.contains_key(&id) {
            return;
        }
        let session = match self.deps.store.get_session(id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(session_id = %id, "session.start for unknown session");
                return;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "session.start read failed");
                return;
            }
        };
        if session.state != SessionState::New {
            return;
        }
        if session.stop_requested_at.is_some() {
            // Stopped before any worker picked it up.
            let _ = self
                .terminate_detached(id, SessionState::Cancelled, StopReason::Cancelled)
                .await;
            return;
        }
        self.spawn_worker(session).await;
    }

    async fn handle_session_stop(self: &Arc<Self>, id: Uuid) {
        if let Some(entry) = self.workers.get(&id) {
            match entry.value().try_send(WorkerCommand::Stop) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A stop is already queued; idempotent.
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        // No live worker: a NEW session can be cancelled directly.
        match self
            .terminate_detached(id, SessionState::Cancelled, StopReason::Cancelled)
            .await
        {
            Ok(true) => debug!(session_id = %id, "cancelled session without worker"),
            Ok(false) => {}
            Err(e) => warn!(session_id = %id, error = %e, "detached cancel failed"),
        }
    }

    async fn handle_lease_lost(self: &Arc<Self>, id: Uuid) {
        if let Some(entry) = self.workers.get(&id) {
            match entry.value().try_send(WorkerCommand::LeaseLost) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => return,
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        match self
            .terminate_detached(id, SessionState::Failed, StopReason::LeaseExpired)
            .await
        {
            Ok(true) => debug!(session_id = %id, "failed expired session without worker"),
            Ok(false) => {}
            Err(e) => warn!(session_id = %id, error = %e, "detached expiry failed"),
        }
    }

    /// Spawn NEW sessions whose `session.start` event was dropped.
    async fn catch_up_new_sessions(self: &Arc<Self>) {
        let query = SessionQuery::default().with_states(&[SessionState::New]);
        let sessions = match self.deps.store.query_sessions(&query).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "catch-up query failed");
                return;
            }
        };
        for session in sessions {
            let id = session.id;
            if !self.workers.contains_key(&id) {
                debug!(session_id = %id, "catching up missed session.start");
                self.handle_session_start(id).await;
            }
        }
    }

    async fn spawn_worker(self: &Arc<Self>, session: SessionRecord) {
        let id = session.id;
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        self.workers.insert(id, cmd_tx);

        let worker = SessionWorker::new(
            self.deps.clone(),
            session,
            cmd_rx,
            self.cancel.child_token(),
        );
        let orch = self.clone();
        self.tasks.lock().await.spawn(async move {
            worker.run().await;
            orch.workers.remove(&id);
        });
    }

    /// Write a terminal state for a session with no live worker, release
    /// its lease and remove its output directory. Returns whether a write
    /// happened.
    async fn terminate_detached(
        &self,
        id: Uuid,
        to: SessionState,
        reason: StopReason,
    ) -> Result<bool> {
        for _ in 0..5 {
            let Some(current) = self.deps.store.get_session(id).await? else {
                return Ok(false);
            };
            if current.is_terminal() || !current.state.can_transition(to) {
                return Ok(false);
            }
            let slot = current.tuner_slot;
            let lease_epoch = current.lease_epoch;
            match self
                .deps
                .store
                .update_session_cas(id, current.epoch, &move |s| s.terminate(to, reason))
                .await
            {
                Ok(updated) => {
                    if let Some(slot) = slot
                        && let Err(e) = self.deps.arbiter.release(id, slot, lease_epoch).await
                    {
                        warn!(session_id = %id, tuner_slot = slot, error = %e, "lease release failed");
                    }
                    cleanup_hls_root(&updated.hls_root).await;
                    return Ok(true);
                }
                Err(Error::CasConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Fail a session that could not be resumed after a restart.
    async fn abandon_session(&self, session: SessionRecord) {
        warn!(
            session_id = %session.id,
            state = %session.state,
            pid = ?session.pid,
            correlation_id = %session.correlation_id,
            "abandoning unresumable session"
        );

        // Reap a stray process if one is somehow still alive.
        if let Some(pid) = session.pid
            && pid_alive(pid)
        {
            let mut handle = self.deps.transcoder.adopt(session.id, pid);
            handle.request_stop();
            tokio::spawn(async move {
                let _ = (&mut handle.exit).await;
            });
        }

        match self
            .terminate_detached(session.id, SessionState::Failed, StopReason::RecoveryAbandoned)
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(session_id = %session.id, error = %e, "abandon write failed"),
        }
    }
}

/// Remove a session's HLS output directory, tolerating absence.
pub(crate) async fn cleanup_hls_root(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "removed HLS output directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "HLS cleanup failed"),
    }
}
