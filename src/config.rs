use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use anyhow::{Context, Result};
use rand::RngCore;
use rand::rngs::OsRng;
use url::Url;
use zeroize::Zeroizing;

/// Google's published signing keys for ID tokens.
pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";
/// Issuers Google puts in the `iss` claim of ID tokens.
pub const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Upper bound for session and cookie lifetimes, in days.
pub const MAX_LIFETIME_DAYS: i64 = 3650;

/// What happens to a request whose history write could not be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistencePolicy {
    /// Log the failure and answer with `historySaved: false`.
    #[default]
    BestEffort,
    /// Fail the request with a persistence error.
    Strict,
}

impl PersistencePolicy {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "best-effort" | "best_effort" | "besteffort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            other => anyhow::bail!("Invalid HISTORY_WRITE_POLICY '{}' (expected best-effort or strict)", other),
        }
    }
}

/// Per-IP request limits for sign-in and generation routes.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Milliseconds after which one request of the burst is replenished.
    pub replenish_ms: u64,
    pub burst: u32,
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// Whether the service runs with production hardening (secure cookies, required secret).
    pub is_production: bool,
    /// The socket address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// The OAuth client id ID tokens must be issued for.
    pub google_client_id: Option<String>,
    /// Where the identity provider publishes its signing keys.
    pub google_jwks_uri: Url,
    /// Accepted `iss` values for ID tokens.
    pub google_issuers: Vec<String>,
    /// The symmetric secret session tokens are signed with.
    pub session_secret: Option<Zeroizing<Vec<u8>>>,
    /// The duration of a session in days.
    pub session_duration_days: i64,
    /// The lifetime of the anonymous session cookie in days.
    pub anon_cookie_days: i64,
    /// Free generations granted to an anonymous session.
    pub free_usage_quota: u32,
    /// Maximum number of history entries kept per identity.
    pub history_cap: usize,
    /// Location of the history database file.
    pub history_db_path: PathBuf,
    pub persistence_policy: PersistencePolicy,
    /// Endpoint of the captioning backend.
    pub captioner_url: Url,
    /// Model checkpoints the captioning backend serves.
    pub caption_models: Vec<String>,
    /// Maximum number of captions generated at the same time.
    pub caption_concurrency: usize,
    /// Maximum accepted request body size in bytes.
    pub max_upload_bytes: usize,
    /// Maximum size of an image fetched from a remote URL.
    pub max_remote_image_bytes: usize,
    /// Origins allowed to call the API with credentials.
    pub cors_origins: Vec<String>,
    pub rate_limit: Option<RateLimit>,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let is_production = env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string()) == "production";

        let session_secret = match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => Some(Zeroizing::new(secret.into_bytes())),
            _ if is_production => {
                anyhow::bail!("JWT_SECRET must be set in production (generate with: openssl rand -hex 32)")
            }
            _ => {
                tracing::warn!("⚠️ JWT_SECRET not set - using an ephemeral secret, sessions will not survive a restart");
                let mut secret = vec![0u8; 32];
                OsRng.fill_bytes(&mut secret);
                Some(Zeroizing::new(secret))
            }
        };

        let google_client_id = env::var("GOOGLE_CLIENT_ID")
            .ok()
            .filter(|id| !id.trim().is_empty());

        let replenish_ms: u64 = parse_var("RATE_LIMIT_REPLENISH_MS", 0)?;
        let burst: u32 = parse_var("RATE_LIMIT_BURST", 20)?;
        let rate_limit = (replenish_ms > 0 && burst > 0).then_some(RateLimit { replenish_ms, burst });

        let config = Self {
            is_production,
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
                .parse()
                .context("Invalid BIND_ADDR")?,
            google_client_id,
            google_jwks_uri: Url::parse(
                &env::var("GOOGLE_JWKS_URI").unwrap_or_else(|_| GOOGLE_JWKS_URI.to_string()),
            )
            .context("Invalid GOOGLE_JWKS_URI")?,
            google_issuers: GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            session_secret,
            session_duration_days: parse_var("SESSION_DURATION_DAYS", 7)?,
            anon_cookie_days: parse_var("ANON_COOKIE_DAYS", 30)?,
            free_usage_quota: parse_var("FREE_USAGE_QUOTA", 1)?,
            history_cap: parse_var("HISTORY_CAP", 100)?,
            history_db_path: PathBuf::from(
                env::var("HISTORY_DB").unwrap_or_else(|_| "./history_db.json".to_string()),
            ),
            persistence_policy: match env::var("HISTORY_WRITE_POLICY") {
                Ok(raw) => PersistencePolicy::parse(&raw)?,
                Err(_) => PersistencePolicy::default(),
            },
            captioner_url: Url::parse(
                &env::var("CAPTIONER_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8001/caption".to_string()),
            )
            .context("Invalid CAPTIONER_URL")?,
            caption_models: split_list(
                &env::var("CAPTION_MODELS")
                    .unwrap_or_else(|_| "caption_model_epoch_250.pth".to_string()),
            ),
            caption_concurrency: parse_var("CAPTION_CONCURRENCY", 4)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            max_remote_image_bytes: parse_var("MAX_REMOTE_IMAGE_BYTES", 10 * 1024 * 1024)?,
            cors_origins: split_list(&env::var("CORS_ORIGINS").unwrap_or_else(|_| {
                "http://localhost:5173,http://127.0.0.1:5173,http://localhost:3000,http://127.0.0.1:3000"
                    .to_string()
            })),
            rate_limit,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the service cannot run with, so they surface at startup.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_LIFETIME_DAYS).contains(&self.session_duration_days) {
            anyhow::bail!(
                "SESSION_DURATION_DAYS must be between 1 and {} (got {})",
                MAX_LIFETIME_DAYS,
                self.session_duration_days
            );
        }
        if !(1..=MAX_LIFETIME_DAYS).contains(&self.anon_cookie_days) {
            anyhow::bail!(
                "ANON_COOKIE_DAYS must be between 1 and {} (got {})",
                MAX_LIFETIME_DAYS,
                self.anon_cookie_days
            );
        }
        if self.history_cap == 0 {
            anyhow::bail!("HISTORY_CAP must be at least 1");
        }
        if self.caption_concurrency == 0 {
            anyhow::bail!("CAPTION_CONCURRENCY must be at least 1");
        }
        if self.max_upload_bytes == 0 || self.max_remote_image_bytes == 0 {
            anyhow::bail!("MAX_UPLOAD_BYTES and MAX_REMOTE_IMAGE_BYTES must be positive");
        }
        if self.caption_models.is_empty() {
            anyhow::bail!("CAPTION_MODELS must name at least one model");
        }
        Ok(())
    }

    /// A development configuration with every knob at its default.
    ///
    /// Used by tests and embedders that wire their own components.
    pub fn for_development(history_db_path: PathBuf, session_secret: &[u8]) -> Self {
        Self {
            is_production: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            google_client_id: None,
            google_jwks_uri: Url::parse(GOOGLE_JWKS_URI).expect("static URL is valid"),
            google_issuers: GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            session_secret: Some(Zeroizing::new(session_secret.to_vec())),
            session_duration_days: 7,
            anon_cookie_days: 30,
            free_usage_quota: 1,
            history_cap: 100,
            history_db_path,
            persistence_policy: PersistencePolicy::BestEffort,
            captioner_url: Url::parse("http://127.0.0.1:8001/caption").expect("static URL is valid"),
            caption_models: vec!["caption_model_epoch_250.pth".to_string()],
            caption_concurrency: 4,
            max_upload_bytes: 10 * 1024 * 1024,
            max_remote_image_bytes: 10 * 1024 * 1024,
            cors_origins: vec!["http://localhost:5173".to_string()],
            rate_limit: None,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
