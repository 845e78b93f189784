//! FFmpeg process supervision.
//!
//! The transcoder owns each FFmpeg child for exactly one session worker.
//! Every termination path waits for the process so nothing is left as a
//! zombie. Graceful stop is SIGTERM, a bounded grace, then SIGKILL. After a
//! restart a still-running FFmpeg can be adopted by pid: liveness and
//! termination then go through signals because no `Child` handle exists.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::profiles::Profile;
use crate::{Error, Result};

/// Spawns and supervises FFmpeg processes.
#[derive(Debug, Clone)]
pub struct Transcoder {
    bin: PathBuf,
    termination_grace: Duration,
}

/// A running (owned or adopted) FFmpeg process.
///
/// Owned by exactly one session worker; never shared.
pub struct TranscodeHandle {
    pid: u32,
    stop: CancellationToken,
    /// Resolves once the process is reaped. `Some(code)` for a normal exit,
    /// `None` when it died to a signal or its exit code is unknown.
    pub exit: oneshot::Receiver<Option<i32>>,
}

impl TranscodeHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Begin graceful termination (SIGTERM → grace → SIGKILL).
    ///
    /// Completion is observed through [`TranscodeHandle::exit`].
    pub fn request_stop(&self) {
        self.stop.cancel();
    }
}

impl Transcoder {
    pub fn new(bin: PathBuf, termination_grace: Duration) -> Self {
        Self {
            bin,
            termination_grace,
        }
    }

    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }

    /// Spawn FFmpeg for a session and hand ownership to the caller.
    ///
    /// Stderr is line-forwarded to the log, tagged with the session id.
    pub fn spawn(
        &self,
        session_id: Uuid,
        profile: &Profile,
        input_url: &str,
        output_dir: &Path,
    ) -> Result<TranscodeHandle> {
        let args = profile.build_args(input_url, output_dir);
        debug!(session_id = %session_id, ?args, "spawning ffmpeg");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::pipeline(format!("failed to spawn ffmpeg: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::pipeline("ffmpeg exited before a pid was assigned"))?;

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(session_id, stderr);
        }

        let stop = CancellationToken::new();
        let exit = spawn_waiter(child, pid, stop.clone(), self.termination_grace);

        Ok(TranscodeHandle { pid, stop, exit })
    }

    /// Adopt an FFmpeg that survived a control-plane restart.
    ///
    /// The process is supervised by pid: liveness is polled with signal 0,
    /// termination is SIGTERM → grace → SIGKILL. The exit code of an
    /// adopted process is unknown.
    pub fn adopt(&self, session_id: Uuid, pid: u32) -> TranscodeHandle {
        let stop = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let grace = self.termination_grace;
        let token = stop.clone();

        tokio::spawn(async move {
            const LIVENESS_POLL: Duration = Duration::from_millis(500);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(session_id = %session_id, pid, "terminating adopted ffmpeg");
                        send_sigterm(pid);
                        let deadline = tokio::time::Instant::now() + grace;
                        while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                            tokio::time::sleep(LIVENESS_POLL.min(grace)).await;
                        }
                        if pid_alive(pid) {
                            warn!(session_id = %session_id, pid, "adopted ffmpeg ignored SIGTERM, killing");
                            send_sigkill(pid);
                        }
                        let _ = tx.send(None);
                        break;
                    }
                    _ = tokio::time::sleep(LIVENESS_POLL) => {
                        if !pid_alive(pid) {
                            debug!(session_id = %session_id, pid, "adopted ffmpeg exited");
                            let _ = tx.send(None);
                            break;
                        }
                    }
                }
            }
        });

        TranscodeHandle { pid, stop, exit: rx }
    }
}

/// Wait for the child, supporting graceful stop via the token.
///
/// The child is moved into the waiter task and is reaped on every path.
fn spawn_waiter(
    mut child: Child,
    pid: u32,
    stop: CancellationToken,
    grace: Duration,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            status = child.wait() => code_of(status),
            _ = stop.cancelled() => {
                debug!(pid, "stop requested, sending SIGTERM to ffmpeg");
                send_sigterm(pid);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => code_of(status),
                    Err(_) => {
                        warn!(pid, "ffmpeg did not exit within grace, killing");
                        let _ = child.kill().await;
                        code_of(child.wait().await)
                    }
                }
            }
        };
        let _ = tx.send(exit_code);
    });

    rx
}

fn code_of(status: std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    match status {
        Ok(exit_status) => exit_status.code(),
        Err(e) => {
            error!("error waiting for ffmpeg process: {e}");
            Some(-1)
        }
    }
}

fn forward_stderr(session_id: Uuid, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("Error") || line.contains("error") {
                warn!(session_id = %session_id, "ffmpeg: {line}");
            } else {
                debug!(session_id = %session_id, "ffmpeg: {line}");
            }
        }
    });
}

/// Whether a process with `pid` is still alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Alive but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_sigkill(_pid: u32) {}
