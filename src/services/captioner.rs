use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{AppError, Result};

/// A model checkpoint the captioning backend can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Turns image bytes into a caption.
///
/// Built once at startup and shared read-only by every request.
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Generates a caption. Failures are reported as `AppError::Generation`.
    async fn generate(&self, image: Bytes, model: Option<&str>) -> Result<String>;

    /// The models this captioner serves.
    fn models(&self) -> Vec<ModelInfo>;
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    caption: String,
}

/// A captioner backed by an inference service over HTTP.
///
/// The image is POSTed as the raw request body and the service answers
/// with `{"caption": "..."}`.
pub struct HttpCaptioner {
    client: Client,
    endpoint: Url,
    models: Vec<ModelInfo>,
}

impl HttpCaptioner {
    pub fn new(endpoint: Url, model_ids: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            endpoint,
            models: model_ids
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    kind: "checkpoint".to_string(),
                })
                .collect(),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config.captioner_url.clone(), &config.caption_models)
    }
}

#[async_trait]
impl Captioner for HttpCaptioner {
    async fn generate(&self, image: Bytes, model: Option<&str>) -> Result<String> {
        let mut url = self.endpoint.clone();
        if let Some(model) = model {
            url.query_pairs_mut().append_pair("model", model);
        }

        tracing::debug!("🖼️ Requesting caption for {} bytes", image.len());

        let resp = self
            .client
            .post(url)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Generation(e.to_string()))?;

        let body: CaptionResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Generation(format!("unexpected response: {}", e)))?;

        let caption = body.caption.trim().to_string();
        if caption.is_empty() {
            return Err(AppError::Generation("empty caption".to_string()));
        }

        Ok(caption)
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }
}
