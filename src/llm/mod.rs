pub mod tensorzero;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use tensorzero::{TensorZeroClient, TensorZeroConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// A single request/response round trip to a language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[LlmMessage]) -> Result<LlmResponse, LlmError>;
}

/// Unwraps a response the model wrapped in a Markdown code fence, either
/// spread over several lines or squeezed onto one.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    if !rest.contains('\n') {
        let body = rest.trim_start_matches(|ch: char| ch.is_ascii_alphanumeric());
        return body.strip_suffix("```").unwrap_or(body).trim().to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Parses a JSON object out of a model reply. Fences are stripped first;
/// when the remainder still fails to parse, the span from the first `{` to
/// the last `}` is tried, which drops lead-in and trailing prose.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    let cleaned = strip_markdown_fence(text);
    let err = match serde_json::from_str(&cleaned) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start > 0 || end + 1 < cleaned.len() => {
            serde_json::from_str(&cleaned[start..=end]).map_err(|_| err)
        }
        _ => Err(err),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    #[test]
    fn strips_fences() {
        assert_eq!(strip_markdown_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_markdown_fence("```\nline1\nline2\n```\ntrailing"), "line1\nline2");
        assert_eq!(strip_markdown_fence("```{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fence("```json {\"a\":1} ```"), "{\"a\":1}");
    }

    #[test]
    fn json_reply_survives_prose_and_one_line_fences() {
        let lead_in: Value =
            parse_json_reply("Here are the values:\n{\"color\":\"White\",\"material\":\"Steel\"}").unwrap();
        assert_eq!(lead_in, json!({"color": "White", "material": "Steel"}));

        let fenced: Value = parse_json_reply("```{\"color\":\"White\"}```").unwrap();
        assert_eq!(fenced, json!({"color": "White"}));

        let trailing: Value = parse_json_reply("{\"a\": 1}\nLet me know if you need more.").unwrap();
        assert_eq!(trailing, json!({"a": 1}));

        assert!(parse_json_reply::<Value>("no json here").is_err());
        assert!(parse_json_reply::<Value>("Sure: {not json}").is_err());
    }
}
