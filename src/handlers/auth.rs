use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tower_cookies::{Cookie, Cookies};
use tower_cookies::cookie::time::Duration;

use crate::{
    config::MAX_LIFETIME_DAYS,
    error::{AppError, Result},
    middleware_layer::caller::{ANON_COOKIE, extract_anon_id},
    state::AppState,
};

/// The request payload for signing in with a Google ID token.
#[derive(Deserialize)]
pub struct GoogleSignInRequest {
    pub token: String,
}

/// The signed-in user as reported back to the client.
#[derive(Serialize)]
pub struct UserInfo {
    pub sub: String,
    pub email: Option<String>,
}

/// The response payload for a successful sign-in.
#[derive(Serialize)]
pub struct SignInResponse {
    pub token: String,
    pub user: UserInfo,
}

/// Creates a cookie with the given name, value, and max age (clamped to
/// [`MAX_LIFETIME_DAYS`]).
pub(crate) fn create_secure_cookie(
    name: &str,
    value: String,
    max_age_days: i64,
    is_production: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_string(), value);

    cookie.set_http_only(true);

    if is_production {
        cookie.set_secure(true);
    }

    cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
    cookie.set_max_age(Duration::seconds(max_age_days.clamp(0, MAX_LIFETIME_DAYS) * 86400));
    cookie.set_path("/");

    cookie
}

/// Expires the anonymous session cookie on the client.
pub(crate) fn clear_anon_cookie(cookies: &Cookies) {
    let mut cookie = Cookie::new(ANON_COOKIE, "");
    cookie.set_max_age(Duration::seconds(0));
    cookie.set_path("/");
    cookies.remove(cookie);
}

/// Handles sign-in with a Google ID token.
///
/// Any anonymous history carried by the `anon_id` cookie moves into the
/// user's history and the cookie is cleared.
#[axum::debug_handler]
pub async fn google_sign_in(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<GoogleSignInRequest>,
) -> Result<Response> {
    tracing::info!("🔐 Google sign-in attempt");

    if payload.token.trim().is_empty() {
        return Err(AppError::Validation("token is required".to_string()));
    }

    let anon_id = extract_anon_id(&cookies);
    let signed_in = state
        .sessions
        .sign_in(payload.token.trim(), anon_id.as_deref())
        .await?;

    if signed_in.clear_anon_cookie {
        clear_anon_cookie(&cookies);
        tracing::info!(
            "✅ Anonymous cookie cleared ({} items merged)",
            signed_in.merged
        );
    }

    let response = SignInResponse {
        token: signed_in.token,
        user: UserInfo {
            sub: signed_in.identity.sub,
            email: signed_in.identity.email,
        },
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}
