use serde::{Deserialize, Serialize};

/// Claims carried by a locally-issued session token.
///
/// The token is self-contained: nothing is stored server-side and expiry
/// is the only way a token stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// The identity provider's stable subject identifier.
    pub sub: String,
    /// The user's email address, empty when the provider did not share one.
    #[serde(default)]
    pub email: String,
    /// Issue time, seconds since the Unix epoch.
    pub iat: i64,
    /// Expiry, seconds since the Unix epoch. The token is valid while `now < exp`.
    pub exp: i64,
}
