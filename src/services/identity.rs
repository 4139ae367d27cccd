use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use moka::sync::Cache;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::identity::VerifiedIdentity;

/// Clock skew tolerated on `exp`/`nbf` of provider-issued tokens.
const CLOCK_SKEW_LEEWAY_SECS: u64 = 30;
/// Upper bound on a JWKS document.
const MAX_JWKS_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Fetches and caches the identity provider's RSA signing keys by `kid`.
#[derive(Clone)]
pub struct JwksProvider {
    cache: Cache<String, Arc<DecodingKey>>,
    client: Client,
    jwks_uri: Url,
}

impl JwksProvider {
    pub fn new(jwks_uri: Url) -> anyhow::Result<Self> {
        Ok(Self {
            cache: Cache::builder()
                .max_capacity(100)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
            jwks_uri,
        })
    }

    /// Returns the key for `kid`, refreshing the key set once on a cache miss.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>> {
        if let Some(key) = self.cache.get(kid) {
            return Ok(key);
        }

        self.refresh().await?;

        self.cache
            .get(kid)
            .ok_or_else(|| AppError::InvalidAssertion(format!("unknown signing key '{}'", kid)))
    }

    async fn refresh(&self) -> Result<()> {
        tracing::info!("🔑 Refreshing identity provider keys from {}", self.jwks_uri);
        let unavailable = |e: reqwest::Error| {
            AppError::InvalidAssertion(format!("signing keys unavailable: {}", e))
        };

        let resp = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(unavailable)?;

        if resp.content_length().is_some_and(|len| len > MAX_JWKS_BYTES) {
            return Err(AppError::InvalidAssertion(
                "signing key document too large".to_string(),
            ));
        }

        let jwks: JwksResponse = resp.json().await.map_err(unavailable)?;

        for key in jwks.keys {
            if let (Some(n), Some(e)) = (&key.n, &key.e) {
                match DecodingKey::from_rsa_components(n, e) {
                    Ok(decoding_key) => {
                        self.cache.insert(key.kid.clone(), Arc::new(decoding_key));
                    }
                    Err(err) => tracing::warn!("Skipping unusable key {}: {}", key.kid, err),
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
enum KeySource {
    Jwks(JwksProvider),
    Static { key: Arc<DecodingKey>, alg: Algorithm },
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    email: Option<String>,
}

/// Verifies ID tokens issued by the federated identity provider.
#[derive(Clone)]
pub struct IdTokenVerifier {
    client_id: Option<String>,
    issuers: Vec<String>,
    keys: KeySource,
}

impl IdTokenVerifier {
    /// A verifier that resolves keys from the configured JWKS endpoint.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            client_id: config.google_client_id.clone(),
            issuers: config.google_issuers.clone(),
            keys: KeySource::Jwks(JwksProvider::new(config.google_jwks_uri.clone())?),
        })
    }

    /// A verifier bound to one fixed key and algorithm.
    pub fn with_static_key(
        client_id: Option<String>,
        issuers: Vec<String>,
        key: DecodingKey,
        alg: Algorithm,
    ) -> Self {
        Self {
            client_id,
            issuers,
            keys: KeySource::Static {
                key: Arc::new(key),
                alg,
            },
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some()
    }

    /// Verifies `assertion` and extracts the subject and email.
    ///
    /// Fails with `Configuration` when no client id is set and with
    /// `InvalidAssertion` for anything wrong with the token itself,
    /// including an audience other than our client id.
    pub async fn verify(&self, assertion: &str) -> Result<VerifiedIdentity> {
        let client_id = self.client_id.as_deref().ok_or_else(|| {
            AppError::Configuration("GOOGLE_CLIENT_ID is not set".to_string())
        })?;

        let header = decode_header(assertion)
            .map_err(|e| AppError::InvalidAssertion(format!("malformed token: {}", e)))?;

        let (key, alg) = match &self.keys {
            KeySource::Static { key, alg } => (key.clone(), *alg),
            KeySource::Jwks(provider) => {
                let kid = header.kid.as_deref().ok_or_else(|| {
                    AppError::InvalidAssertion("token has no key id".to_string())
                })?;
                (provider.get_key(kid).await?, Algorithm::RS256)
            }
        };

        if header.alg != alg {
            return Err(AppError::InvalidAssertion(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let mut validation = Validation::new(alg);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
        validation.set_audience(&[client_id]);
        validation.set_issuer(&self.issuers[..]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);

        let claims = decode::<IdTokenClaims>(assertion, &key, &validation)
            .map_err(|e| AppError::InvalidAssertion(e.to_string()))?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(AppError::InvalidAssertion("empty subject".to_string()));
        }

        tracing::debug!("✅ ID token verified for subject {}", claims.sub);

        Ok(VerifiedIdentity {
            sub: claims.sub,
            email: claims.email.filter(|e| !e.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &[u8] = b"identity-provider-test-key";
    const CLIENT_ID: &str = "client-123.apps.googleusercontent.com";

    fn verifier(client_id: Option<&str>) -> IdTokenVerifier {
        IdTokenVerifier::with_static_key(
            client_id.map(str::to_string),
            vec!["https://accounts.google.com".to_string()],
            DecodingKey::from_secret(SECRET),
            Algorithm::HS256,
        )
    }

    fn id_token(claims: serde_json::Value) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn claims() -> serde_json::Value {
        let now = Utc::now().timestamp();
        json!({
            "sub": "1122334455",
            "email": "person@example.com",
            "aud": CLIENT_ID,
            "iss": "https://accounts.google.com",
            "iat": now,
            "exp": now + 3600,
        })
    }

    #[tokio::test]
    async fn accepts_valid_token() {
        let identity = verifier(Some(CLIENT_ID)).verify(&id_token(claims())).await.unwrap();
        assert_eq!(identity.sub, "1122334455");
        assert_eq!(identity.email.as_deref(), Some("person@example.com"));
    }

    #[tokio::test]
    async fn email_is_optional() {
        let mut c = claims();
        c.as_object_mut().unwrap().remove("email");
        let identity = verifier(Some(CLIENT_ID)).verify(&id_token(c)).await.unwrap();
        assert_eq!(identity.email, None);
    }

    #[tokio::test]
    async fn rejects_other_audience() {
        let mut c = claims();
        c["aud"] = json!("someone-else.apps.googleusercontent.com");
        let res = verifier(Some(CLIENT_ID)).verify(&id_token(c)).await;
        assert!(matches!(res, Err(AppError::InvalidAssertion(_))));
    }

    #[tokio::test]
    async fn rejects_untrusted_issuer() {
        let mut c = claims();
        c["iss"] = json!("https://evil.example.com");
        let res = verifier(Some(CLIENT_ID)).verify(&id_token(c)).await;
        assert!(matches!(res, Err(AppError::InvalidAssertion(_))));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let mut c = claims();
        c["exp"] = json!(Utc::now().timestamp() - 3600);
        let res = verifier(Some(CLIENT_ID)).verify(&id_token(c)).await;
        assert!(matches!(res, Err(AppError::InvalidAssertion(_))));
    }

    #[tokio::test]
    async fn rejects_empty_subject() {
        let mut c = claims();
        c["sub"] = json!("");
        let res = verifier(Some(CLIENT_ID)).verify(&id_token(c)).await;
        assert!(matches!(res, Err(AppError::InvalidAssertion(_))));
    }

    #[tokio::test]
    async fn rejects_garbage_and_foreign_signatures() {
        let v = verifier(Some(CLIENT_ID));
        assert!(matches!(v.verify("garbage").await, Err(AppError::InvalidAssertion(_))));

        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims(),
            &EncodingKey::from_secret(b"not-the-provider"),
        )
        .unwrap();
        assert!(matches!(v.verify(&forged).await, Err(AppError::InvalidAssertion(_))));
    }

    #[tokio::test]
    async fn missing_client_id_is_a_configuration_error() {
        let res = verifier(None).verify(&id_token(claims())).await;
        assert!(matches!(res, Err(AppError::Configuration(_))));
    }
}
