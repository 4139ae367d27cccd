use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::Config;
use crate::crypto::session_token::SessionCodec;
use crate::error::{AppError, Result};
use crate::repositories::history::HistoryStore;
use crate::services::captioner::{Captioner, HttpCaptioner};
use crate::services::identity::IdTokenVerifier;
use crate::services::session::SessionManager;

/// Bounds the number of captions generated at the same time.
#[derive(Clone)]
pub struct CaptionLimiter {
    semaphore: Arc<Semaphore>,
}

impl CaptionLimiter {
    /// Creates a new `CaptionLimiter`.
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Waits for a free generation slot.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Caption limiter closed: {}", e)))
    }

    /// Returns the number of available permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Arc<Config>,
    /// Sign-in, quota and history orchestration.
    pub sessions: SessionManager,
    /// The captioning backend.
    pub captioner: Arc<dyn Captioner>,
    pub caption_limiter: CaptionLimiter,
    /// Client used to download images by URL.
    pub http: reqwest::Client,
}

impl AppState {
    /// Creates a new `AppState` with the production collaborators.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let verifier = IdTokenVerifier::from_config(config)?;
        if !verifier.is_configured() {
            tracing::warn!("⚠️ GOOGLE_CLIENT_ID not set - sign-in will be rejected");
        }

        let captioner = HttpCaptioner::from_config(config)?;
        tracing::info!("✅ Captioner configured at {}", config.captioner_url);

        Self::with_components(config, verifier, Arc::new(captioner))
    }

    /// Creates a new `AppState` around the given verifier and captioner.
    pub fn with_components(
        config: &Config,
        verifier: IdTokenVerifier,
        captioner: Arc<dyn Captioner>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = Arc::new(HistoryStore::new(
            config.history_db_path.clone(),
            config.history_cap,
        ));
        tracing::info!("✅ History store at {}", config.history_db_path.display());

        let codec = SessionCodec::new(
            config.session_secret.clone(),
            chrono::Duration::try_days(config.session_duration_days)
                .context("SESSION_DURATION_DAYS is out of range")?,
        );

        let sessions = SessionManager::new(
            Arc::new(verifier),
            codec,
            store,
            config.free_usage_quota,
            config.persistence_policy,
        );

        let caption_limiter = CaptionLimiter::new(config.caption_concurrency);
        tracing::info!(
            "✅ Caption limiter initialized ({} slots)",
            caption_limiter.available_permits()
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(AppState {
            config: Arc::new(config.clone()),
            sessions,
            captioner,
            caption_limiter,
            http,
        })
    }
}
