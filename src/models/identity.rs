use serde::{Deserialize, Serialize};

/// The identity extracted from a verified ID token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    /// Issuer-scoped unique subject, never empty.
    pub sub: String,
    pub email: Option<String>,
}
