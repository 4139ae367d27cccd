use axum::{
    extract::State,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, Result},
    services::captioner::ModelInfo,
    state::AppState,
};

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
pub struct SelectModelRequest {
    pub model: String,
}

#[derive(Serialize)]
pub struct SelectModelResponse {
    pub ok: bool,
    pub selected: String,
}

/// Lists the models the captioner serves.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelsResponse {
        models: state.captioner.models(),
    })
}

/// Confirms that a model exists; the model itself is chosen per generation request.
pub async fn select_model(
    State(state): State<AppState>,
    Json(payload): Json<SelectModelRequest>,
) -> Result<Json<SelectModelResponse>> {
    let known = state
        .captioner
        .models()
        .into_iter()
        .any(|m| m.id == payload.model);

    if !known {
        return Err(AppError::NotFound);
    }

    Ok(Json(SelectModelResponse {
        ok: true,
        selected: payload.model,
    }))
}
