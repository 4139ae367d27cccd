use axum::{
    body::Bytes,
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use tower_cookies::Cookies;

use crate::{
    error::{AppError, Result},
    handlers::auth::create_secure_cookie,
    middleware_layer::caller::ANON_COOKIE,
    models::history::UsageRecord,
    services::session::CallerContext,
    state::AppState,
    validation::{
        history::GenerateUrlRequest,
        image::{validate_image_bytes, validate_remote_url},
    },
};

/// The response payload for a generated caption.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub caption: String,
    /// `false` when the caption was produced but could not be written to history.
    pub history_saved: bool,
}

/// Runs the captioner under the concurrency limit.
async fn caption(state: &AppState, image: Bytes, model: Option<&str>) -> Result<String> {
    let _permit = state.caption_limiter.acquire().await?;
    state.captioner.generate(image, model).await
}

/// Records a generated caption for the caller and builds the response.
async fn record_and_respond(
    state: &AppState,
    caller: &CallerContext,
    cookies: &Cookies,
    record: UsageRecord,
) -> Result<Response> {
    let caption = record.caption.clone();
    let receipt = state.sessions.record_usage(caller, record).await?;

    if let Some(anon_id) = receipt.new_anon_id {
        cookies.add(create_secure_cookie(
            ANON_COOKIE,
            anon_id,
            state.config.anon_cookie_days,
            state.config.is_production,
        ));
        tracing::debug!("🍪 Anonymous session cookie issued");
    }

    let response = GenerateResponse {
        caption,
        history_saved: receipt.history_saved,
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles captioning of an uploaded image (`file` and optional `model` fields).
#[axum::debug_handler]
pub async fn generate(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerContext>,
    cookies: Cookies,
    mut multipart: Multipart,
) -> Result<Response> {
    state.sessions.ensure_quota(&caller).await?;

    let mut image: Option<Bytes> = None;
    let mut model: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Multipart(format!("Parse error: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                tracing::info!(
                    "📥 /api/generate upload: {}",
                    field.file_name().unwrap_or("<unnamed>")
                );
                image = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::Multipart(format!("file: {}", e)))?,
                );
            }
            "model" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::Multipart(format!("model: {}", e)))?;
                model = Some(value.trim().to_string()).filter(|m| !m.is_empty());
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| AppError::Multipart("Missing file field".to_string()))?;
    validate_image_bytes(&image)?;

    let caption = caption(&state, image, model.as_deref()).await?;
    let record = UsageRecord::new(caption).with_model(model);

    record_and_respond(&state, &caller, &cookies, record).await
}

/// Downloads an image, refusing bodies larger than `limit` bytes.
async fn fetch_image(state: &AppState, url: url::Url, limit: usize) -> Result<Bytes> {
    let mut resp = state
        .http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AppError::ImageFetch(e.to_string()))?;

    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(AppError::ImageFetch("image too large".to_string()));
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| AppError::ImageFetch(e.to_string()))?
    {
        if body.len() + chunk.len() > limit {
            return Err(AppError::ImageFetch("image too large".to_string()));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(body))
}

/// Handles captioning of an externally hosted image.
#[axum::debug_handler]
pub async fn generate_url(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerContext>,
    cookies: Cookies,
    Json(payload): Json<GenerateUrlRequest>,
) -> Result<Response> {
    let payload = payload.validated()?;
    let url = validate_remote_url(&payload.image_url)?;
    tracing::info!("📥 /api/generate_url: {}", url);

    state.sessions.ensure_quota(&caller).await?;

    let image = fetch_image(&state, url, state.config.max_remote_image_bytes).await?;
    validate_image_bytes(&image)?;

    let caption = caption(&state, image, payload.model.as_deref()).await?;
    let record = UsageRecord::new(caption)
        .with_image_url(Some(payload.image_url))
        .with_image_path(payload.image_path)
        .with_model(payload.model);

    record_and_respond(&state, &caller, &cookies, record).await
}
