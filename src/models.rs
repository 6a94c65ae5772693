use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::onboarding::{WizardView, submission::SubmissionMode};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// Outcome of a successful submission, cached per `Idempotency-Key`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub property_id: String,
    pub mode: SubmissionMode,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWizardRequest {
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_label: Option<String>,
    /// Open an existing record for editing instead of starting a draft.
    #[serde(default)]
    pub property_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldUpdate {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldQuery {
    pub path: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LocateRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyRequest {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    /// Base64 (standard alphabet) file body.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveAssetRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct WizardResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub view: WizardView,
}
