pub mod engine;
pub mod request;
pub mod values;

use crate::llm::LlmError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use engine::{ExtractionConfig, ExtractionEngine, ExtractionRun, ProgressSink, ProgressUpdate};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("language model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unparseable extraction response: {0}")]
    MalformedResponse(String),
}

/// Values extracted for one product. An empty map marks a product whose
/// extraction failed; `null` values mean the source text did not say.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub product_id: String,
    pub values: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn filled(&self) -> usize {
        self.values.values().filter(|value| !value.is_null()).count()
    }
}
