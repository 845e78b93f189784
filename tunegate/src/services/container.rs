//! Service container for dependency injection.
//!
//! The container is the single root object: configuration, store, bus,
//! arbiter, orchestrator and the intent service are constructed once at
//! startup and passed explicitly. No component reaches for ambient state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{self, AppState};
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::lease::{LeaseArbiter, spawn_expiry_sweeper};
use crate::orchestrator::{Orchestrator, RecoverySummary};
use crate::pipeline::{ProfileRegistry, Transcoder};
use crate::services::intents::IntentService;
use crate::store::{SessionStore, open_store};
use crate::{Error, Result};
use enigma2::Enigma2Client;

/// Root container holding all application services.
pub struct ServiceContainer {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn SessionStore>,
    pub bus: EventBus,
    pub arbiter: Arc<LeaseArbiter>,
    pub orchestrator: Arc<Orchestrator>,
    pub intents: Arc<IntentService>,
    receiver: Enigma2Client,
    cancel: CancellationToken,
}

impl ServiceContainer {
    /// Open the configured store backend and wire all services.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let store = open_store(&config.store, &config.tuner.slots).await?;
        Self::with_store(config, store)
    }

    /// Wire services over an already-open store (used by tests).
    pub fn with_store(config: Arc<AppConfig>, store: Arc<dyn SessionStore>) -> Result<Self> {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();

        let arbiter = Arc::new(LeaseArbiter::new(store.clone(), config.tuner.slots.clone()));
        let receiver =
            Enigma2Client::new(&config.receiver.base_url, config.receiver.tune_timeout())?;
        let receiver_probe = receiver.clone();
        let transcoder = Transcoder::new(
            config.ffmpeg.bin.clone(),
            config.ffmpeg.termination_grace(),
        );
        let profiles = Arc::new(ProfileRegistry::builtin());

        let orchestrator = Orchestrator::new(
            store.clone(),
            arbiter.clone(),
            bus.clone(),
            receiver,
            transcoder,
            profiles.clone(),
            config.session.clone(),
            config.receiver.tune_timeout(),
            cancel.child_token(),
        );

        let intents = Arc::new(IntentService::new(
            store.clone(),
            arbiter.clone(),
            bus.clone(),
            profiles,
            config.session.clone(),
            config.hls.root.clone(),
        ));

        Ok(Self {
            config,
            store,
            bus,
            arbiter,
            orchestrator,
            intents,
            receiver: receiver_probe,
            cancel,
        })
    }

    /// Recover in-flight sessions, then start the orchestrator dispatcher
    /// and the expiry sweeper.
    ///
    /// Recovery runs to completion before any bus event is serviced, so
    /// restarts cannot race fresh intents.
    pub async fn initialize(&self) -> Result<RecoverySummary> {
        // Non-fatal probe: sessions can be admitted while the receiver is
        // down, they just fail to prime.
        if let Err(e) = self.receiver.about().await {
            tracing::warn!(
                receiver = %self.config.receiver.base_url,
                error = %e,
                "receiver web API is not answering"
            );
        }

        let summary = self.orchestrator.recover().await?;
        self.orchestrator.start();
        let _ = spawn_expiry_sweeper(
            self.store.clone(),
            self.bus.clone(),
            self.config.session.expiry_check_interval(),
            self.cancel.child_token(),
        );
        Ok(summary)
    }

    /// Serve the HTTP API until shutdown; runs in the background.
    pub fn start_api_server(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.bind, self.config.server.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid listen address: {e}")))?;
        let state = AppState::new(self.intents.clone());
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr, cancel).await {
                tracing::error!(error = %e, "API server terminated");
            }
        });
        Ok(())
    }

    /// Drain all workers and stop background tasks.
    ///
    /// Worker drain is bounded by `shutdown.timeout`; stragglers are
    /// aborted rather than holding the process hostage.
    pub async fn shutdown(&self) {
        info!("shutting down services");
        self.orchestrator
            .shutdown(self.config.shutdown.timeout())
            .await;
        self.cancel.cancel();
        info!("services shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
