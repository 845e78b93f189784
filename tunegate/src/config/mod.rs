//! Application configuration.
//!
//! Every default lives here and only here; components receive resolved,
//! typed values. Configuration is layered: `tunegate.toml` (optional),
//! then `TUNEGATE_*` environment variables (`__` as section separator,
//! e.g. `TUNEGATE_SESSION__LEASE_TTL_SECS=30`). Nothing is hot-reloadable;
//! the process restarts to pick up changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::{Error, Result};

/// Which state-store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Non-durable, for tests and ephemeral deployments.
    Memory,
    /// Embedded SQLite file, the production default.
    Sqlite,
    /// Embedded redb key-value file.
    Redb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8990,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunerConfig {
    /// Physical tuner slot indices, e.g. `"0,1"` or `[0, 1]`. Required.
    #[serde(deserialize_with = "deserialize_slots")]
    pub slots: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub lease_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Defaults to half the lease TTL when unset.
    pub expiry_check_interval_secs: Option<u64>,
    pub prime_deadline_secs: u64,
    pub drain_grace_secs: u64,
    pub playability_poll_ms: u64,
    /// How long terminal records are retained for late polls.
    pub retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 15,
            heartbeat_interval_secs: 5,
            expiry_check_interval_secs: None,
            prime_deadline_secs: 10,
            drain_grace_secs: 3,
            playability_poll_ms: 200,
            retention_secs: 900,
        }
    }
}

impl SessionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        self.expiry_check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs((self.lease_ttl_secs / 2).max(1)))
    }

    pub fn prime_deadline(&self) -> Duration {
        Duration::from_secs(self.prime_deadline_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn playability_poll(&self) -> Duration {
        Duration::from_millis(self.playability_poll_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    pub bin: PathBuf,
    pub termination_grace_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("ffmpeg"),
            termination_grace_secs: 5,
        }
    }
}

impl FfmpegConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Base URL of the Enigma2 web API (scheme + host + web port).
    pub base_url: String,
    pub tune_timeout_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".to_string(),
            tune_timeout_secs: 10,
        }
    }
}

impl ReceiverConfig {
    pub fn tune_timeout(&self) -> Duration {
        Duration::from_secs(self.tune_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Sqlite,
            path: PathBuf::from("tunegate.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Root directory for per-session HLS output. Must be writable.
    pub root: PathBuf,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("hls"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Root configuration object, constructed once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub tuner: TunerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Load configuration from `path` (optional file) layered with
    /// `TUNEGATE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TUNEGATE")
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder
            .build()
            .map_err(|e| Error::config(e.to_string()))?
            .try_deserialize::<AppConfig>()
            .map_err(|e| Error::config(e.to_string()))?;
        Ok(cfg)
    }

    /// Validate invariants that must hold before any component starts.
    ///
    /// Failures here are fatal to the process.
    pub fn validate(&self) -> Result<()> {
        if self.tuner.slots.is_empty() {
            return Err(Error::config("tuner.slots must list at least one slot"));
        }
        let mut sorted = self.tuner.slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.tuner.slots.len() {
            return Err(Error::config("tuner.slots contains duplicate slots"));
        }

        if self.session.lease_ttl_secs == 0 {
            return Err(Error::config("session.lease_ttl_secs must be positive"));
        }
        if self.session.heartbeat_interval_secs * 2 > self.session.lease_ttl_secs {
            return Err(Error::config(
                "session.heartbeat_interval_secs must be at most half the lease TTL",
            ));
        }
        if self.session.playability_poll_ms == 0 {
            return Err(Error::config("session.playability_poll_ms must be positive"));
        }

        Url::parse(&self.receiver.base_url)
            .map_err(|e| Error::config(format!("receiver.base_url: {e}")))?;

        if !ffmpeg_binary_exists(&self.ffmpeg.bin) {
            return Err(Error::config(format!(
                "ffmpeg.bin '{}' not found",
                self.ffmpeg.bin.display()
            )));
        }

        ensure_writable_dir(&self.hls.root)
            .map_err(|e| Error::config(format!("hls.root '{}': {e}", self.hls.root.display())))?;

        Ok(())
    }
}

/// Accept tuner slots as either a TOML array or a comma-separated string.
fn deserialize_slots<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SlotsRepr {
        List(Vec<u32>),
        Csv(String),
    }

    match SlotsRepr::deserialize(deserializer)? {
        SlotsRepr::List(slots) => Ok(slots),
        SlotsRepr::Csv(s) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|e| D::Error::custom(format!("bad tuner slot '{part}': {e}")))
            })
            .collect(),
    }
}

fn ffmpeg_binary_exists(bin: &Path) -> bool {
    if bin.components().count() > 1 {
        return bin.is_file();
    }
    // Bare binary name: resolve through PATH.
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
}

fn ensure_writable_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".tunegate-write-probe");
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
