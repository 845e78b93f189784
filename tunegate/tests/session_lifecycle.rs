#![cfg(unix)]
//! End-to-end session lifecycle scenarios against a stub transcoder.
//!
//! The stub stands in for FFmpeg: the "writing" variant produces a valid
//! playlist plus one segment and then idles, the "silent" variant produces
//! nothing. Both die cleanly on SIGTERM, so the full supervision path is
//! exercised.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use tunegate::Error;
use tunegate::config::{
    AppConfig, FfmpegConfig, HlsConfig, ReceiverConfig, SessionConfig, TunerConfig,
};
use tunegate::domain::{SessionRecord, SessionState, StopReason};
use tunegate::services::intents::CreateIntent;
use tunegate::services::ServiceContainer;
use tunegate::store::{MemoryStore, SessionStore};

const WRITING_STUB: &str = r#"#!/bin/sh
for last; do :; done
dir=$(dirname "$last")
mkdir -p "$dir"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.0,\nseg-00001.ts\n' > "$last"
printf 'stub-ts-bytes' > "$dir/seg-00001.ts"
exec sleep 600
"#;

const SILENT_STUB: &str = "#!/bin/sh\nexec sleep 600\n";

fn stub_transcoder(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("ffmpeg-stub.sh");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_config(tmp: &Path, ffmpeg: PathBuf) -> AppConfig {
    AppConfig {
        server: Default::default(),
        tuner: TunerConfig { slots: vec![0] },
        session: SessionConfig {
            lease_ttl_secs: 6,
            heartbeat_interval_secs: 3,
            expiry_check_interval_secs: Some(1),
            prime_deadline_secs: 5,
            drain_grace_secs: 0,
            playability_poll_ms: 50,
            retention_secs: 900,
        },
        ffmpeg: FfmpegConfig {
            bin: ffmpeg,
            termination_grace_secs: 2,
        },
        receiver: ReceiverConfig {
            // Nothing listens here; the worker falls back to the playlist
            // URL and the stub ignores its input anyway.
            base_url: "http://127.0.0.1:9".into(),
            tune_timeout_secs: 1,
        },
        store: Default::default(),
        hls: HlsConfig {
            root: tmp.join("hls"),
        },
        shutdown: Default::default(),
    }
}

async fn container_with(config: AppConfig) -> ServiceContainer {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&config.tuner.slots).await.unwrap();
    let container = ServiceContainer::with_store(Arc::new(config), store).unwrap();
    container.initialize().await.unwrap();
    container
}

fn intent() -> CreateIntent {
    CreateIntent {
        service_ref: "1:0:1:445D:453:1:C00000:0:0:0:".into(),
        profile_id: "hls_720p".into(),
        idempotency_key: None,
    }
}

async fn wait_for(
    container: &ServiceContainer,
    id: Uuid,
    what: &str,
    timeout: Duration,
    pred: impl Fn(&SessionRecord) -> bool,
) -> SessionRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let session = container.intents.get(id).await.unwrap();
        if pred(&session) {
            return session;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {what}; state={} reason={:?}",
                session.state, session.stop_reason
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_reaches_ready_heartbeats_and_stops_clean() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), WRITING_STUB);
    let container = container_with(test_config(tmp.path(), stub)).await;

    let outcome = container.intents.create(intent(), "req-happy").await.unwrap();
    let id = outcome.session_id;

    let ready = wait_for(&container, id, "READY", Duration::from_secs(10), |s| {
        s.state == SessionState::Ready
    })
    .await;

    // READY means the artifacts are on disk right now.
    let playlist = ready.hls_root.join("index.m3u8");
    let contents = std::fs::read_to_string(&playlist).unwrap();
    assert!(contents.starts_with("#EXTM3U"));
    assert!(ready.hls_root.join("seg-00001.ts").metadata().unwrap().len() > 0);
    assert!(ready.pid.is_some());

    // Heartbeats keep pushing the deadline out.
    let first = container.intents.heartbeat(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = container.intents.heartbeat(id).await.unwrap();
    assert!(second > first);

    container.intents.stop(id).await.unwrap();
    let stopped = wait_for(&container, id, "STOPPED", Duration::from_secs(10), |s| {
        s.state == SessionState::Stopped
    })
    .await;
    assert_eq!(stopped.stop_reason, Some(StopReason::UserStopped));
    assert_eq!(stopped.tuner_slot, None);

    // Slot is free again, output directory is gone.
    let lease = container.store.get_lease(0).await.unwrap().unwrap();
    assert!(lease.holder.is_none());
    assert!(!ready.hls_root.exists());

    // A second stop on a terminal session stays idempotent.
    container.intents.stop(id).await.unwrap();

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_contention_returns_busy_without_side_effects() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), WRITING_STUB);
    let container = container_with(test_config(tmp.path(), stub)).await;

    let first = container.intents.create(intent(), "req-a").await.unwrap();
    let err = container.intents.create(intent(), "req-b").await.unwrap_err();
    assert!(matches!(err, Error::TunerBusy));

    // Exactly one session exists.
    let sessions = container.intents.list(10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, first.session_id);

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_idempotent_intents_converge_on_one_session() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), WRITING_STUB);
    let container = container_with(test_config(tmp.path(), stub)).await;

    let mut keyed = intent();
    keyed.idempotency_key = Some("replay-42".into());

    let (a, b) = tokio::join!(
        container.intents.create(keyed.clone(), "req-1"),
        container.intents.create(keyed.clone(), "req-2"),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(container.intents.list(10).await.unwrap().len(), 1);

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_pipeline_fails_with_prime_timeout() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), SILENT_STUB);
    let mut config = test_config(tmp.path(), stub);
    config.session.prime_deadline_secs = 2;
    let container = container_with(config).await;

    let outcome = container.intents.create(intent(), "req-prime").await.unwrap();
    let failed = wait_for(
        &container,
        outcome.session_id,
        "FAILED",
        Duration::from_secs(10),
        |s| s.state == SessionState::Failed,
    )
    .await;
    assert_eq!(failed.stop_reason, Some(StopReason::PrimeTimeout));

    // The playlist never appeared, the process is gone, the slot is free.
    assert!(!failed.hls_root.join("index.m3u8").exists());
    if let Some(pid) = failed.pid {
        assert!(!tunegate::pipeline::pid_alive(pid));
    }
    let lease = container.store.get_lease(0).await.unwrap().unwrap();
    assert!(lease.holder.is_none());

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_while_priming_cancels_the_session() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), SILENT_STUB);
    let container = container_with(test_config(tmp.path(), stub)).await;

    let outcome = container.intents.create(intent(), "req-cancel").await.unwrap();
    wait_for(
        &container,
        outcome.session_id,
        "PRIMING",
        Duration::from_secs(5),
        |s| s.state == SessionState::Priming,
    )
    .await;

    container.intents.stop(outcome.session_id).await.unwrap();
    let cancelled = wait_for(
        &container,
        outcome.session_id,
        "CANCELLED",
        Duration::from_secs(10),
        |s| s.state == SessionState::Cancelled,
    )
    .await;
    assert_eq!(cancelled.stop_reason, Some(StopReason::Cancelled));

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missed_heartbeats_expire_the_lease_and_fail_the_session() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), WRITING_STUB);
    let mut config = test_config(tmp.path(), stub);
    config.session.lease_ttl_secs = 2;
    config.session.heartbeat_interval_secs = 1;
    let container = container_with(config).await;

    let outcome = container.intents.create(intent(), "req-expiry").await.unwrap();
    wait_for(
        &container,
        outcome.session_id,
        "READY",
        Duration::from_secs(5),
        |s| s.state == SessionState::Ready,
    )
    .await;

    // No heartbeats: within one sweep past the TTL the session fails.
    let failed = wait_for(
        &container,
        outcome.session_id,
        "FAILED after lease expiry",
        Duration::from_secs(10),
        |s| s.state == SessionState::Failed,
    )
    .await;
    assert_eq!(failed.stop_reason, Some(StopReason::LeaseExpired));

    // The slot is reusable and late heartbeats are rejected for good.
    let lease = container.store.get_lease(0).await.unwrap().unwrap();
    assert!(lease.holder.is_none() || lease.holder != Some(outcome.session_id));
    let err = container.intents.heartbeat(outcome.session_id).await.unwrap_err();
    assert!(matches!(err, Error::LeaseExpired));

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn process_shutdown_drains_active_sessions_to_stopped() {
    let tmp = TempDir::new().unwrap();
    let stub = stub_transcoder(tmp.path(), WRITING_STUB);
    let container = container_with(test_config(tmp.path(), stub)).await;

    let outcome = container.intents.create(intent(), "req-drain").await.unwrap();
    wait_for(
        &container,
        outcome.session_id,
        "READY",
        Duration::from_secs(10),
        |s| s.state == SessionState::Ready,
    )
    .await;

    container.shutdown().await;

    let session = container.intents.get(outcome.session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(session.stop_reason, Some(StopReason::Cleanup));
    if let Some(pid) = session.pid {
        assert!(!tunegate::pipeline::pid_alive(pid));
    }
}
