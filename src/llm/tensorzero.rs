use crate::config::LlmSettings;
use crate::llm::{ChatModel, LlmError, LlmMessage, LlmResponse, LlmUsage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TensorZeroConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: String,
    pub model: Option<String>,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl TensorZeroConfig {
    /// One gateway config per TensorZero function (matching, extraction).
    pub fn for_function(settings: &LlmSettings, function_name: &str) -> Self {
        Self {
            gateway_url: settings.gateway_url.clone(),
            api_key: settings.api_key.clone(),
            function_name: function_name.to_string(),
            model: settings.model.clone(),
            max_attempts: settings.max_attempts.max(1),
            retry_base: settings.retry_base,
        }
    }
}

pub struct TensorZeroClient {
    http: Client,
    config: TensorZeroConfig,
}

enum Attempt {
    Retry(LlmError),
    Fatal(LlmError),
}

impl TensorZeroClient {
    pub fn new(http: Client, config: TensorZeroConfig) -> Self {
        Self { http, config }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .retry_base
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    async fn attempt(&self, url: &str, body: &ChatRequest<'_>) -> Result<LlmResponse, Attempt> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| Attempt::Retry(LlmError::Http(err.to_string())))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Retry(LlmError::RateLimited {
                attempts: self.config.max_attempts,
            }));
        }
        if status.is_server_error() {
            return Err(Attempt::Retry(LlmError::Http(format!("HTTP {status}"))));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(LlmError::Http(format!("HTTP {status}"))));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| Attempt::Fatal(LlmError::InvalidResponse(err.to_string())))?;

        let text = payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .and_then(|item| item.text)
            .ok_or_else(|| Attempt::Fatal(LlmError::InvalidResponse("missing text".into())))?;

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }
}

#[async_trait]
impl ChatModel for TensorZeroClient {
    async fn chat(&self, messages: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let system: Vec<&str> = messages
            .iter()
            .filter(|message| message.role == "system")
            .map(|message| message.content.as_str())
            .collect();
        let body = ChatRequest {
            function_name: &self.config.function_name,
            model_name: self.config.model.as_deref(),
            input: ChatInput {
                system: (!system.is_empty()).then(|| system.join("\n\n")),
                messages: messages
                    .iter()
                    .filter(|message| message.role != "system")
                    .collect(),
            },
        };
        let url = format!("{gateway}/inference");

        let mut attempt = 1;
        loop {
            match self.attempt(&url, &body).await {
                Ok(response) => {
                    debug!(
                        target = "metafield.llm",
                        function = %self.config.function_name,
                        attempt,
                        input_tokens = response.usage.and_then(|u| u.input_tokens),
                        output_tokens = response.usage.and_then(|u| u.output_tokens),
                        "inference completed"
                    );
                    return Ok(response);
                }
                Err(Attempt::Fatal(err)) => return Err(err),
                Err(Attempt::Retry(err)) if attempt >= self.config.max_attempts => return Err(err),
                Err(Attempt::Retry(err)) => {
                    let wait = self.backoff(attempt);
                    warn!(
                        target = "metafield.llm",
                        function = %self.config.function_name,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying inference"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    function_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    input: ChatInput<'a>,
}

#[derive(Debug, Serialize)]
struct ChatInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}
