use garde::Validate;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::history::{UsageRecord, now_timestamp};

/// Longest caption accepted into a history.
pub const MAX_CAPTION_LEN: usize = 2_000;

/// A history item submitted directly by an authenticated client.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistoryItemRequest {
    #[garde(length(min = 1))]
    pub caption: String,
    #[garde(range(min = 0.0))]
    pub timestamp: Option<f64>,
    #[garde(length(min = 1, max = 2048))]
    pub image_url: Option<String>,
    #[garde(length(min = 1, max = 2048))]
    pub image_path: Option<String>,
    #[garde(length(min = 1, max = 256))]
    pub model: Option<String>,
}

impl HistoryItemRequest {
    /// Validates the request and turns it into a history record.
    pub fn into_record(self) -> Result<UsageRecord> {
        validate(&self)?;

        if self.caption.trim().is_empty() {
            return Err(AppError::Validation("Caption cannot be empty".to_string()));
        }
        if self.caption.chars().count() > MAX_CAPTION_LEN {
            return Err(AppError::Validation(format!(
                "Caption exceeds {} characters",
                MAX_CAPTION_LEN
            )));
        }

        Ok(UsageRecord {
            caption: self.caption,
            timestamp: self.timestamp.unwrap_or_else(now_timestamp),
            image_url: self.image_url,
            image_path: self.image_path,
            model: self.model,
        })
    }
}

/// A request to caption an image hosted elsewhere.
#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GenerateUrlRequest {
    #[garde(url, length(max = 2048))]
    pub image_url: String,
    #[garde(length(min = 1, max = 256))]
    pub model: Option<String>,
    #[garde(length(min = 1, max = 2048))]
    pub image_path: Option<String>,
}

impl GenerateUrlRequest {
    pub fn validated(self) -> Result<Self> {
        validate(&self)?;
        Ok(self)
    }
}

/// Validates `value`, flattening the report into a validation error.
pub fn validate<T: Validate<Context = ()>>(value: &T) -> Result<()> {
    value
        .validate()
        .map_err(|report| AppError::Validation(report.to_string().trim().to_string()))
}
