#![cfg(unix)]
//! Crash-recovery scenarios.
//!
//! The restart is simulated by seeding the store with in-flight sessions
//! (and matching leases) before the container initializes, exactly the
//! state a killed control plane leaves behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use tunegate::config::{
    AppConfig, FfmpegConfig, HlsConfig, ReceiverConfig, SessionConfig, TunerConfig,
};
use tunegate::domain::{SessionRecord, SessionState, StopReason};
use tunegate::services::ServiceContainer;
use tunegate::store::{MemoryStore, SessionStore};

fn stub_transcoder(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("ffmpeg-stub.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 600\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_config(tmp: &Path) -> AppConfig {
    AppConfig {
        server: Default::default(),
        tuner: TunerConfig { slots: vec![0] },
        session: SessionConfig {
            lease_ttl_secs: 30,
            heartbeat_interval_secs: 5,
            expiry_check_interval_secs: Some(1),
            prime_deadline_secs: 5,
            drain_grace_secs: 0,
            playability_poll_ms: 50,
            retention_secs: 900,
        },
        ffmpeg: FfmpegConfig {
            bin: stub_transcoder(tmp),
            termination_grace_secs: 2,
        },
        receiver: ReceiverConfig {
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

/// Seed a READY session with a held lease, as a crashed process left it.
async fn seed_ready_session(
    store: &Arc<dyn SessionStore>,
    hls_base: &Path,
    pid: u32,
) -> SessionRecord {
    let session_id = Uuid::new_v4();
    let lease = store
        .acquire_lease(session_id, &[0], Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let mut session = SessionRecord::new(
        session_id,
        "1:0:1:445D:453:1:C00000:0:0:0:",
        "hls_720p",
        lease.slot,
        lease.epoch,
        lease.expires_at,
        hls_base,
        5,
        30,
        "req-recovery",
    );
    session.state = SessionState::Ready;
    session.pid = Some(pid);
    store.put_session(&session).await.unwrap();
    session
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_process_is_abandoned_and_slot_freed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&[0]).await.unwrap();

    // A pid that has certainly exited.
    let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let session = seed_ready_session(&store, &tmp.path().join("hls"), dead_pid).await;

    let container = ServiceContainer::with_store(Arc::new(config), store.clone()).unwrap();
    let summary = container.initialize().await.unwrap();
    assert_eq!(summary.resumed, 0);
    assert_eq!(summary.abandoned, 1);

    let recovered = container.intents.get(session.id).await.unwrap();
    assert_eq!(recovered.state, SessionState::Failed);
    assert_eq!(recovered.stop_reason, Some(StopReason::RecoveryAbandoned));

    // The slot can be admitted again immediately.
    let lease = store.get_lease(0).await.unwrap().unwrap();
    assert!(lease.holder.is_none());

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn live_process_with_valid_lease_is_resumed_and_stoppable() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&[0]).await.unwrap();

    // A transcoder that survived the control-plane crash.
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("600")
        .spawn()
        .unwrap();
    let pid = child.id();

    let session = seed_ready_session(&store, &tmp.path().join("hls"), pid).await;

    let container = ServiceContainer::with_store(Arc::new(config), store.clone()).unwrap();
    let summary = container.initialize().await.unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.abandoned, 0);

    // The resumed worker owns the adopted process; a client stop drives
    // the normal teardown by pid.
    container.intents.stop(session.id).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let current = container.intents.get(session.id).await.unwrap();
        if current.state == SessionState::Stopped {
            assert_eq!(current.stop_reason, Some(StopReason::UserStopped));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session stuck in {} after resume",
            current.state
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The adopted process was terminated with a signal.
    let status = child.wait().unwrap();
    assert!(!status.success());

    let lease = store.get_lease(0).await.unwrap().unwrap();
    assert!(lease.holder.is_none());

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_new_sessions_are_abandoned_on_recovery() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&[0]).await.unwrap();

    // NEW session whose start event died with the old process; no pid yet.
    let session_id = Uuid::new_v4();
    let lease = store
        .acquire_lease(session_id, &[0], Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let session = SessionRecord::new(
        session_id,
        "1:0:1:445D:453:1:C00000:0:0:0:",
        "hls_720p",
        lease.slot,
        lease.epoch,
        lease.expires_at,
        &tmp.path().join("hls"),
        5,
        30,
        "req-stale-new",
    );
    store.put_session(&session).await.unwrap();

    let container = ServiceContainer::with_store(Arc::new(config), store.clone()).unwrap();
    let summary = container.initialize().await.unwrap();
    assert_eq!(summary.abandoned, 1);

    let recovered = container.intents.get(session_id).await.unwrap();
    assert_eq!(recovered.state, SessionState::Failed);
    assert_eq!(recovered.stop_reason, Some(StopReason::RecoveryAbandoned));

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn winding_down_session_with_expired_lease_is_abandoned() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&[0]).await.unwrap();

    let mut child = std::process::Command::new("/bin/sleep")
        .arg("600")
        .spawn()
        .unwrap();
    let pid = child.id();

    // DRAINING with a lease that lapsed during the outage: the recovery
    // rule is unconditional, so this is abandoned like any other session.
    let session_id = Uuid::new_v4();
    let lease = store
        .acquire_lease(session_id, &[0], Duration::from_millis(0))
        .await
        .unwrap()
        .unwrap();
    let mut session = SessionRecord::new(
        session_id,
        "1:0:1:445D:453:1:C00000:0:0:0:",
        "hls_720p",
        lease.slot,
        lease.epoch,
        Utc::now(),
        &tmp.path().join("hls"),
        5,
        30,
        "req-draining",
    );
    session.state = SessionState::Draining;
    session.pid = Some(pid);
    session.stop_requested_at = Some(Utc::now());
    store.put_session(&session).await.unwrap();

    let container = ServiceContainer::with_store(Arc::new(config), store.clone()).unwrap();
    let summary = container.initialize().await.unwrap();
    assert_eq!(summary.resumed, 0);
    assert_eq!(summary.abandoned, 1);

    let recovered = container.intents.get(session_id).await.unwrap();
    assert_eq!(recovered.state, SessionState::Failed);
    assert_eq!(recovered.stop_reason, Some(StopReason::RecoveryAbandoned));

    // The stray transcoder is still reaped.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match child.try_wait().unwrap() {
            Some(status) => {
                assert!(!status.success());
                break;
            }
            None => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "stray process was never terminated"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_lease_blocks_resumption_even_with_live_process() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    store.ensure_slots(&[0]).await.unwrap();

    let mut child = std::process::Command::new("/bin/sleep")
        .arg("600")
        .spawn()
        .unwrap();
    let pid = child.id();

    let session_id = Uuid::new_v4();
    // Lease expires immediately: the slot may already belong to someone
    // else, so the session must not be resumed.
    let lease = store
        .acquire_lease(session_id, &[0], Duration::from_millis(0))
        .await
        .unwrap()
        .unwrap();
    let mut session = SessionRecord::new(
        session_id,
        "1:0:1:445D:453:1:C00000:0:0:0:",
        "hls_720p",
        lease.slot,
        lease.epoch,
        Utc::now(),
        &tmp.path().join("hls"),
        5,
        30,
        "req-expired-lease",
    );
    session.state = SessionState::Ready;
    session.pid = Some(pid);
    store.put_session(&session).await.unwrap();

    let container = ServiceContainer::with_store(Arc::new(config), store.clone()).unwrap();
    let summary = container.initialize().await.unwrap();
    assert_eq!(summary.resumed, 0);
    assert_eq!(summary.abandoned, 1);

    let recovered = container.intents.get(session_id).await.unwrap();
    assert_eq!(recovered.state, SessionState::Failed);
    assert_eq!(recovered.stop_reason, Some(StopReason::RecoveryAbandoned));

    // The stray process is reaped rather than leaked.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match child.try_wait().unwrap() {
            Some(status) => {
                assert!(!status.success());
                break;
            }
            None => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "stray process was never terminated"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    container.shutdown().await;
}
