use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tracing::{debug, info, warn};

pub const KEY_HEADER: &str = "X-Metafield-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub label: String,
    pub key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    label: String,
    key_id: String,
}

impl AuthState {
    /// Parses `label:key` pairs separated by commas.
    pub fn from_settings(raw: &str) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            label: record.label.clone(),
            key_id: record.key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Metafield-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    debug!(target = "metafield.api", client = %context.label, key_id = %context.key_id, "request authenticated");
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let label = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (label, key) {
            (Some(label), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    KeyRecord {
                        label: label.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            // Never log the entry itself; it may be a bare secret.
            _ => warn!(
                target = "metafield.api",
                position = idx + 1,
                "ignored malformed API_KEYS entry"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "metafield.api",
            "API_KEYS produced no keys; falling back to local development credentials"
        );
        entries.insert(
            "dev-key".to_string(),
            KeyRecord {
                label: "dev".to_string(),
                key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "metafield.api",
            key_count = entries.len(),
            "loaded API keys"
        );
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_labelled_keys_and_skips_malformed() {
        let state = AuthState::from_settings("ops:alpha, broken ,bulk: beta,:nolabel");
        let ctx = state.authenticate("alpha").unwrap();
        assert_eq!(ctx.label, "ops");
        assert_eq!(ctx.key_id, "key-01");
        assert_eq!(state.authenticate("beta").unwrap().key_id, "key-03");
        assert!(state.authenticate("broken").is_none());
        assert!(state.authenticate("nolabel").is_none());
    }

    #[test]
    fn empty_config_falls_back_to_dev_key() {
        let state = AuthState::from_settings("");
        assert_eq!(state.authenticate("dev-key").unwrap().label, "dev");
    }

    #[test]
    fn reads_bearer_and_custom_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer  alpha "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("alpha"));

        let mut headers = http::HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static("beta"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("beta"));

        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_api_key(&headers), None);
    }
}
