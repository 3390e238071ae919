use crate::catalog::ProductRecord;
use crate::extract::ExtractionRun;
use crate::matcher::CategoryMatch;
use crate::reconcile::{CanonicalRecord, EditedRecord, ReconcileReport, UploadPayload};
use crate::taxonomy::ResolvedSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MatchRequest {
    pub tag: String,
    #[serde(default)]
    pub products: Vec<ProductRecord>,
    /// Ignore a stored match and ask the model again.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    pub category_match: CategoryMatch,
    pub cached: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractRequest {
    pub category_id: String,
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractResponse {
    pub schema: ResolvedSchema,
    pub run: ExtractionRun,
    pub upload: UploadPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupOverrides {
    /// Skip matching and use this category.
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub refresh_match: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GroupRunRequest {
    pub tag: String,
    pub products: Vec<ProductRecord>,
    #[serde(default)]
    pub overrides: Option<GroupOverrides>,
}

#[derive(Debug, Serialize, Clone)]
pub struct GroupRunResponse {
    pub tag: String,
    pub category_match: CategoryMatch,
    pub schema: ResolvedSchema,
    pub run: ExtractionRun,
    pub upload: UploadPayload,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRunRequest {
    pub groups: Vec<GroupRunRequest>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub struct BatchGroupOutcome {
    pub tag: String,
    pub result: Option<GroupRunResponse>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize, Clone)]
pub struct BatchRunResponse {
    pub succeeded: usize,
    pub failed: usize,
    pub groups: Vec<BatchGroupOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileRequest {
    /// Edited records in `{title, attributes}` form.
    #[serde(default)]
    pub edited: Vec<EditedRecord>,
    /// Raw spreadsheet rows keyed by column header.
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    pub canonical: Vec<CanonicalRecord>,
    /// Category whose schema supplies display names and enum checks.
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub include_display: bool,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub struct ReconcileResponse {
    pub records: Vec<CanonicalRecord>,
    pub report: ReconcileReport,
    pub upload: UploadPayload,
    pub display: Option<Vec<Map<String, Value>>>,
}

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

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
