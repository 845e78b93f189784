//! Per-session worker task.
//!
//! One worker owns one session: it is the only writer of that session's
//! state transitions, it owns the FFmpeg process, and it enforces the prime
//! deadline and drain grace. All writes go through the store CAS; a rejected
//! CAS whose state moved under us means a newer writer exists and the worker
//! abandons the session without touching the process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::playability::{Playability, check_playable};
use super::{WorkerDeps, cleanup_hls_root};
use crate::bus::BusEvent;
use crate::domain::{SessionRecord, SessionState, StopReason};
use crate::pipeline::{Profile, TranscodeHandle};
use crate::{Error, Result};

/// Commands routed to a worker by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Client asked for the session to stop.
    Stop,
    /// The expiry sweeper saw the lease deadline pass.
    LeaseLost,
}

/// What a select round produced.
enum Step {
    Tick,
    Deadline,
    Exit(Option<i32>),
    Cmd(Option<WorkerCommand>),
    Shutdown,
}

pub(crate) struct SessionWorker {
    deps: Arc<WorkerDeps>,
    session: SessionRecord,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    shutdown: CancellationToken,
}

impl SessionWorker {
    pub(crate) fn new(
        deps: Arc<WorkerDeps>,
        session: SessionRecord,
        cmd_rx: mpsc::Receiver<WorkerCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            deps,
            session,
            cmd_rx,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let session_id = self.session.id;
        let result = if self.session.state == SessionState::New {
            self.start_fresh().await
        } else {
            self.resume().await
        };

        match result {
            Ok(()) => debug!(session_id = %session_id, "session worker finished"),
            Err(Error::CasConflict { .. }) => {
                // A newer writer owns the session now; its process is no
                // longer ours to touch.
                warn!(session_id = %session_id, "newer writer took over, abandoning session");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "session worker aborted");
                self.mark_failed_internal().await;
            }
        }
    }

    async fn start_fresh(&mut self) -> Result<()> {
        self.advance(SessionState::Starting).await?;

        let input_url = self.tune_and_resolve().await?;
        tokio::fs::create_dir_all(&self.session.hls_root).await?;

        let profile = self
            .deps
            .profiles
            .get(&self.session.profile_id)
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!("unknown profile '{}'", self.session.profile_id))
            })?;

        let handle = match self.deps.transcoder.spawn(
            self.session.id,
            &profile,
            &input_url,
            &self.session.hls_root,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    session_id = %self.session.id,
                    correlation_id = %self.session.correlation_id,
                    error = %e,
                    "transcoder spawn failed"
                );
                return self.terminate_detached(SessionState::Failed, StopReason::FfmpegCrashed)
                    .await;
            }
        };

        let pid = handle.pid();
        self.write(move |s| {
            s.transition(SessionState::Priming)?;
            s.pid = Some(pid);
            Ok(())
        })
        .await?;
        info!(
            session_id = %self.session.id,
            tuner_slot = ?self.session.tuner_slot,
            pid,
            "transcoder spawned, priming"
        );

        self.prime(handle, &profile).await
    }

    /// Re-enter a session that survived a restart; the process is adopted
    /// by pid.
    async fn resume(&mut self) -> Result<()> {
        let pid = self
            .session
            .pid
            .ok_or_else(|| Error::internal("resume without a recorded pid"))?;
        let handle = self.deps.transcoder.adopt(self.session.id, pid);
        let profile = self
            .deps
            .profiles
            .get(&self.session.profile_id)
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!("unknown profile '{}'", self.session.profile_id))
            })?;

        info!(
            session_id = %self.session.id,
            pid,
            state = %self.session.state,
            "resumed session ownership"
        );

        match self.session.state {
            SessionState::Starting => {
                self.advance(SessionState::Priming).await?;
                self.prime(handle, &profile).await
            }
            SessionState::Priming => self.prime(handle, &profile).await,
            SessionState::Ready => self.serve(handle).await,
            SessionState::Draining => {
                self.advance(SessionState::Stopping).await?;
                self.reap(handle).await;
                self.complete_stop(StopReason::UserStopped).await
            }
            SessionState::Stopping => {
                self.reap(handle).await;
                let reason = if self.session.stop_requested_at.is_some() {
                    StopReason::UserStopped
                } else {
                    StopReason::Cleanup
                };
                self.complete_stop(reason).await
            }
            other => Err(Error::internal(format!("cannot resume from state {other}"))),
        }
    }

    /// Tune the receiver and resolve the TS input URL.
    ///
    /// Receiver failures are not fatal here: FFmpeg is pointed at the
    /// receiver's playlist endpoint instead and the prime deadline decides.
    async fn tune_and_resolve(&self) -> Result<String> {
        let tune_timeout = self.deps.tune_timeout;
        let service_ref = &self.session.service_ref;

        match tokio::time::timeout(tune_timeout, self.deps.receiver.zap(service_ref)).await {
            Ok(Ok(())) => debug!(session_id = %self.session.id, "receiver tuned"),
            Ok(Err(e)) => warn!(
                session_id = %self.session.id,
                error = %e,
                "receiver zap failed, continuing to prime"
            ),
            Err(_) => warn!(
                session_id = %self.session.id,
                "receiver zap timed out, continuing to prime"
            ),
        }

        match tokio::time::timeout(tune_timeout, self.deps.receiver.stream_url(service_ref)).await
        {
            Ok(Ok(url)) => Ok(url.to_string()),
            Ok(Err(e)) => {
                warn!(
                    session_id = %self.session.id,
                    error = %e,
                    "stream URL resolution failed, falling back to playlist URL"
                );
                Ok(self.deps.receiver.playlist_url(service_ref)?.to_string())
            }
            Err(_) => {
                warn!(
                    session_id = %self.session.id,
                    "stream URL resolution timed out, falling back to playlist URL"
                );
                Ok(self.deps.receiver.playlist_url(service_ref)?.to_string())
            }
        }
    }

    /// PRIMING: poll the output directory until playable or out of time.
    async fn prime(&mut self, mut handle: TranscodeHandle, profile: &Profile) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.deps.session_cfg.prime_deadline();
        let mut poll = tokio::time::interval(self.deps.session_cfg.playability_poll());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                _ = poll.tick() => Step::Tick,
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
                exit = &mut handle.exit => Step::Exit(exit.ok().flatten()),
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                _ = self.shutdown.cancelled() => Step::Shutdown,
            };

            match step {
                Step::Tick => {
                    self.deps.bus.publish(BusEvent::PipelineTick {
                        session_id: self.session.id,
                    });
                    if check_playable(&self.session.hls_root, &profile.playlist_name).await
                        == Playability::Ready
                    {
                        self.advance(SessionState::Ready).await?;
                        info!(
                            session_id = %self.session.id,
                            tuner_slot = ?self.session.tuner_slot,
                            correlation_id = %self.session.correlation_id,
                            "session is READY"
                        );
                        return self.serve(handle).await;
                    }
                }
                Step::Deadline => {
                    warn!(
                        session_id = %self.session.id,
                        "prime deadline exceeded, failing session"
                    );
                    return self
                        .abort(handle, SessionState::Failed, StopReason::PrimeTimeout)
                        .await;
                }
                Step::Exit(code) => {
                    warn!(
                        session_id = %self.session.id,
                        exit_code = ?code,
                        "transcoder exited while priming"
                    );
                    return self
                        .terminate_detached(SessionState::Failed, StopReason::FfmpegCrashed)
                        .await;
                }
                Step::Cmd(Some(WorkerCommand::Stop)) => {
                    return self
                        .abort(handle, SessionState::Cancelled, StopReason::Cancelled)
                        .await;
                }
                Step::Cmd(Some(WorkerCommand::LeaseLost)) => {
                    return self
                        .abort(handle, SessionState::Failed, StopReason::LeaseExpired)
                        .await;
                }
                Step::Cmd(None) | Step::Shutdown => return self.shutdown_drain(handle).await,
            }
        }
    }

    /// READY: watch the process, the client and the lease.
    async fn serve(&mut self, mut handle: TranscodeHandle) -> Result<()> {
        loop {
            let step = tokio::select! {
                exit = &mut handle.exit => Step::Exit(exit.ok().flatten()),
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                _ = self.shutdown.cancelled() => Step::Shutdown,
            };

            match step {
                Step::Exit(code) => {
                    warn!(
                        session_id = %self.session.id,
                        exit_code = ?code,
                        "transcoder exited while serving"
                    );
                    return self
                        .terminate_detached(SessionState::Failed, StopReason::FfmpegCrashed)
                        .await;
                }
                Step::Cmd(Some(WorkerCommand::Stop)) => {
                    self.advance(SessionState::Draining).await?;
                    return self.drain(handle).await;
                }
                Step::Cmd(Some(WorkerCommand::LeaseLost)) => {
                    return self
                        .abort(handle, SessionState::Failed, StopReason::LeaseExpired)
                        .await;
                }
                Step::Cmd(None) | Step::Shutdown => return self.shutdown_drain(handle).await,
                Step::Tick | Step::Deadline => unreachable!("not selected while serving"),
            }
        }
    }

    /// DRAINING: let the pipeline flush for the grace window, then stop.
    async fn drain(&mut self, mut handle: TranscodeHandle) -> Result<()> {
        let grace = tokio::time::sleep(self.deps.session_cfg.drain_grace());
        tokio::pin!(grace);

        loop {
            let step = tokio::select! {
                _ = &mut grace => Step::Deadline,
                exit = &mut handle.exit => Step::Exit(exit.ok().flatten()),
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                _ = self.shutdown.cancelled() => Step::Shutdown,
            };

            match step {
                Step::Deadline | Step::Shutdown | Step::Cmd(None) => break,
                Step::Exit(_) => {
                    // Pipeline finished on its own during the grace window.
                    self.advance(SessionState::Stopping).await?;
                    return self.complete_stop(StopReason::UserStopped).await;
                }
                // Repeated stops are idempotent; a lost lease no longer
                // matters while winding down.
                Step::Cmd(Some(_)) => continue,
                Step::Tick => unreachable!("not selected while draining"),
            }
        }

        self.advance(SessionState::Stopping).await?;
        self.reap(handle).await;
        self.complete_stop(StopReason::UserStopped).await
    }

    /// Process-wide shutdown: drain to STOPPING, reap, flush terminal state.
    async fn shutdown_drain(&mut self, handle: TranscodeHandle) -> Result<()> {
        debug!(session_id = %self.session.id, "shutdown drain");
        self.advance(SessionState::Stopping).await?;
        self.reap(handle).await;
        self.complete_stop(StopReason::Cleanup).await
    }

    /// Kill and reap the process, then write `to` with `reason`.
    async fn abort(
        &mut self,
        handle: TranscodeHandle,
        to: SessionState,
        reason: StopReason,
    ) -> Result<()> {
        self.reap(handle).await;
        self.terminate_detached(to, reason).await
    }

    /// Write a terminal state for a session whose process is already gone,
    /// then release the lease and remove the output directory.
    async fn terminate_detached(&mut self, to: SessionState, reason: StopReason) -> Result<()> {
        let slot = self.session.tuner_slot;
        let lease_epoch = self.session.lease_epoch;
        self.write(move |s| s.terminate(to, reason)).await?;
        self.release_lease(slot, lease_epoch).await;
        cleanup_hls_root(&self.session.hls_root).await;
        info!(
            session_id = %self.session.id,
            state = %to,
            stop_reason = %reason,
            correlation_id = %self.session.correlation_id,
            "session terminated"
        );
        Ok(())
    }

    /// STOPPING → STOPPED bookkeeping.
    async fn complete_stop(&mut self, reason: StopReason) -> Result<()> {
        self.terminate_detached(SessionState::Stopped, reason).await
    }

    /// Request graceful termination and wait for the process to be reaped.
    async fn reap(&self, mut handle: TranscodeHandle) {
        handle.request_stop();
        let limit = self.deps.transcoder.termination_grace() + Duration::from_secs(5);
        match tokio::time::timeout(limit, &mut handle.exit).await {
            Ok(Ok(code)) => {
                debug!(session_id = %self.session.id, exit_code = ?code, "transcoder reaped")
            }
            Ok(Err(_)) => {
                debug!(session_id = %self.session.id, "transcoder waiter dropped before exit")
            }
            Err(_) => warn!(
                session_id = %self.session.id,
                "transcoder did not report exit within the kill window"
            ),
        }
    }

    async fn release_lease(&self, slot: Option<u32>, lease_epoch: u64) {
        let Some(slot) = slot else {
            return;
        };
        if let Err(e) = self
            .deps
            .arbiter
            .release(self.session.id, slot, lease_epoch)
            .await
        {
            warn!(
                session_id = %self.session.id,
                tuner_slot = slot,
                error = %e,
                "lease release failed"
            );
        }
    }

    async fn advance(&mut self, to: SessionState) -> Result<()> {
        self.write(move |s| s.transition(to)).await
    }

    /// CAS write with re-read on benign conflicts.
    ///
    /// Heartbeats and stop intents bump the epoch without changing state;
    /// those conflicts are retried against the fresh record. A conflict
    /// where the state itself moved means another writer owns the session
    /// and the write is abandoned.
    async fn write<F>(&mut self, mutate: F) -> Result<()>
    where
        F: Fn(&mut SessionRecord) -> Result<()> + Send + Sync,
    {
        const MAX_ATTEMPTS: usize = 5;
        for attempt in 0..MAX_ATTEMPTS {
            let expected = self.session.epoch;
            match self
                .deps
                .store
                .update_session_cas(self.session.id, expected, &mutate)
                .await
            {
                Ok(updated) => {
                    self.session = updated;
                    return Ok(());
                }
                Err(Error::CasConflict { .. }) => {
                    let latest = self.deps.store.get_session(self.session.id).await?;
                    match latest {
                        Some(latest) if latest.state == self.session.state => {
                            self.session = latest;
                        }
                        _ => {
                            return Err(Error::CasConflict {
                                entity_type: "Session",
                                id: self.session.id.to_string(),
                                expected,
                            });
                        }
                    }
                }
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::CasConflict {
            entity_type: "Session",
            id: self.session.id.to_string(),
            expected: self.session.epoch,
        })
    }

    /// Best-effort FAILED/INTERNAL write after an unrecoverable worker bug.
    async fn mark_failed_internal(&mut self) {
        if self.session.is_terminal() {
            return;
        }
        let slot = self.session.tuner_slot;
        let lease_epoch = self.session.lease_epoch;
        let write = self
            .write(|s| {
                if s.state.is_terminal() {
                    return Ok(());
                }
                s.terminate(SessionState::Failed, StopReason::Internal)
            })
            .await;
        if let Err(e) = write {
            warn!(
                session_id = %self.session.id,
                error = %e,
                "could not flush FAILED state"
            );
            return;
        }
        self.release_lease(slot, lease_epoch).await;
    }
}
