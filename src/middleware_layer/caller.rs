use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use tower_cookies::Cookies;

use crate::{services::session::CallerContext, state::AppState};

/// Name of the cookie carrying the anonymous session id.
pub const ANON_COOKIE: &str = "anon_id";

/// Extracts the bearer token from the `Authorization` header.
///
/// # Arguments
///
/// * `request` - The incoming request.
///
/// # Returns
///
/// An `Option` containing the token if the header uses the `Bearer` scheme.
pub fn extract_bearer_token(request: &Request<Body>) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Reads the anonymous session id cookie.
pub fn extract_anon_id(cookies: &Cookies) -> Option<String> {
    cookies
        .get(ANON_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// A middleware that resolves who is calling and stores it as a request extension.
///
/// It never rejects a request: handlers decide what each caller may do.
pub async fn resolve_caller(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let bearer = extract_bearer_token(&request);
    let anon_id = extract_anon_id(&cookies);

    let caller = state
        .sessions
        .resolve(bearer.as_deref(), anon_id.as_deref());

    match &caller {
        CallerContext::Authenticated(claims) => {
            tracing::debug!("🔐 Authenticated caller: {}", claims.sub)
        }
        CallerContext::Anonymous(id) => tracing::debug!("👤 Anonymous caller: {}", id),
        CallerContext::Fresh if bearer.is_some() => {
            tracing::debug!("❌ Ignoring invalid or expired session token")
        }
        CallerContext::Fresh => tracing::debug!("👤 New caller"),
    }

    request.extensions_mut().insert(caller);

    next.run(request).await
}
