use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use http::{HeaderValue, Method, header};
use tower_cookies::CookieManagerLayer;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{config::Config, handlers, middleware_layer, state::AppState};

fn cors_layer(config: &Config) -> Result<CorsLayer> {
    let origins = config
        .cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin '{}'", origin))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::COOKIE,
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400)))
}

/// Builds the HTTP application.
///
/// Every API route sees the caller resolved by
/// [`middleware_layer::caller::resolve_caller`]. Sign-in and generation
/// routes are additionally rate limited per peer IP when configured, which
/// requires serving with connect info.
pub fn router(state: AppState) -> Result<Router> {
    let config = state.config.clone();

    let mut gated_routes = Router::new()
        .route("/api/auth/google", post(handlers::auth::google_sign_in))
        .route("/api/generate", post(handlers::generate::generate))
        .route("/api/generate_url", post(handlers::generate::generate_url));

    if let Some(limit) = config.rate_limit {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_millisecond(limit.replenish_ms)
                .burst_size(limit.burst)
                .use_headers()
                .finish()
                .context("Invalid rate limit configuration")?,
        );
        gated_routes = gated_routes.layer(GovernorLayer::new(governor_conf));
        tracing::info!(
            "✅ Rate limiting enabled (burst {}, replenish every {}ms)",
            limit.burst,
            limit.replenish_ms
        );
    }

    let open_routes = Router::new()
        .route(
            "/api/history",
            get(handlers::history::get_history).post(handlers::history::post_history),
        )
        .route("/api/models", get(handlers::models::list_models))
        .route("/api/models/select", post(handlers::models::select_model));

    let app = Router::new()
        .merge(gated_routes)
        .merge(open_routes)
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::caller::resolve_caller,
        ))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(CookieManagerLayer::new())
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors_layer(&config)?);

    Ok(app)
}
