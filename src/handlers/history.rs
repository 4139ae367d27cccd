use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;

use crate::{
    error::Result,
    models::history::UsageRecord,
    services::session::CallerContext,
    state::AppState,
    validation::history::HistoryItemRequest,
};

/// The response payload for a history listing.
#[derive(Serialize)]
pub struct HistoryResponse {
    pub history: Vec<UsageRecord>,
}

/// The response payload for a history append.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub ok: bool,
    pub history_saved: bool,
}

/// Lists the caller's history, newest first.
#[axum::debug_handler]
pub async fn get_history(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerContext>,
) -> Result<Response> {
    let history = state.sessions.history(&caller).await?;
    tracing::debug!("📜 Returning {} history entries", history.len());

    Ok((StatusCode::OK, Json(HistoryResponse { history })).into_response())
}

/// Appends a client-supplied item to the signed-in user's history.
#[axum::debug_handler]
pub async fn post_history(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerContext>,
    Json(payload): Json<HistoryItemRequest>,
) -> Result<Response> {
    let record = payload.into_record()?;
    let receipt = state.sessions.append_history(&caller, record).await?;

    let response = AppendResponse {
        ok: true,
        history_saved: receipt.history_saved,
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}
