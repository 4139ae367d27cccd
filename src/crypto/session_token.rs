use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use zeroize::Zeroizing;

use crate::error::{AppError, Result};
use crate::models::session::SessionClaims;

/// Session tokens are HMAC-signed JWTs.
const SESSION_ALG: Algorithm = Algorithm::HS256;

/// Mints and verifies the bearer tokens handed out at sign-in.
#[derive(Clone)]
pub struct SessionCodec {
    secret: Option<Zeroizing<Vec<u8>>>,
    default_ttl: Duration,
}

impl SessionCodec {
    /// Creates a new `SessionCodec`.
    ///
    /// # Arguments
    ///
    /// * `secret` - The signing secret. `None` makes every `mint` fail.
    /// * `default_ttl` - Lifetime used by [`SessionCodec::mint_default`].
    pub fn new(secret: Option<Zeroizing<Vec<u8>>>, default_ttl: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            default_ttl,
        }
    }

    /// Mints a token valid for the configured default lifetime.
    pub fn mint_default(&self, subject: &str, email: &str) -> Result<String> {
        self.mint(subject, email, self.default_ttl)
    }

    /// Mints a token for `subject` expiring `ttl` from now.
    pub fn mint(&self, subject: &str, email: &str, ttl: Duration) -> Result<String> {
        self.mint_at(subject, email, ttl, Utc::now().timestamp())
    }

    /// Mints a token as if the current time were `now` (Unix seconds).
    pub fn mint_at(&self, subject: &str, email: &str, ttl: Duration, now: i64) -> Result<String> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            AppError::Configuration("session signing secret is not configured".to_string())
        })?;

        if ttl <= Duration::zero() {
            return Err(AppError::Configuration(
                "session lifetime must be positive".to_string(),
            ));
        }

        let claims = SessionClaims {
            sub: subject.to_string(),
            email: email.to_string(),
            iat: now,
            exp: now + ttl.num_seconds(),
        };

        encode(
            &Header::new(SESSION_ALG),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|e| AppError::Internal(format!("Session token encoding failed: {}", e)))
    }

    /// Verifies `token` against the current time.
    ///
    /// Any decode, signature or expiry failure yields `None`: a stale or forged
    /// token simply means the caller is not authenticated.
    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verifies `token` as if the current time were `now` (Unix seconds).
    pub fn verify_at(&self, token: &str, now: i64) -> Option<SessionClaims> {
        let secret = self.secret.as_ref()?;

        // Expiry is checked below against `now`, with no leeway.
        let mut validation = Validation::new(SESSION_ALG);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = match decode::<SessionClaims>(token, &DecodingKey::from_secret(secret), &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!("Rejected session token: {}", e);
                return None;
            }
        };

        if claims.sub.is_empty() || claims.exp <= claims.iat {
            tracing::debug!("Rejected session token with inconsistent claims");
            return None;
        }

        if now >= claims.exp {
            tracing::debug!("Session token expired for subject {}", claims.sub);
            return None;
        }

        Some(claims)
    }
}
