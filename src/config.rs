use crate::matcher::Confidence;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has an invalid value `{value}`")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub match_function: String,
    pub extract_function: String,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub taxonomy_snapshot_path: PathBuf,
    pub port: u16,
    pub extract_concurrency: usize,
    pub llm_request_timeout: Duration,
    pub match_sample_size: usize,
    pub match_candidates: usize,
    pub match_min_confidence: Confidence,
    pub schema_inherit_from_ancestors: bool,
    pub redis_url: Option<String>,
    pub match_cache_ttl_secs: u64,
    /// Raw `label:key,...` list, parsed by the auth layer.
    pub api_keys: String,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
    /// Finished jobs kept for status polling; the oldest are evicted first.
    pub job_retention: usize,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub llm: LlmSettings,
}

pub const MAX_EXTRACT_CONCURRENCY: usize = 64;

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable source so tests never
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let taxonomy_snapshot_path = var("TAXONOMY_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("TAXONOMY_SNAPSHOT_PATH"))?;

        let match_min_confidence = match var("MATCH_MIN_CONFIDENCE") {
            Some(raw) => Confidence::parse_label(&raw).ok_or(ConfigError::Invalid {
                var: "MATCH_MIN_CONFIDENCE",
                value: raw,
            })?,
            None => Confidence::Low,
        };

        let schema_inherit_from_ancestors = match var("SCHEMA_INHERIT_FROM_ANCESTORS") {
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::Invalid {
                var: "SCHEMA_INHERIT_FROM_ANCESTORS",
                value: raw,
            })?,
            None => true,
        };

        // Present but unparsable numbers are rejected, never defaulted.
        let number = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            var(name)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map_err(|_| ConfigError::Invalid { var: name, value: raw })
                })
                .transpose()
        };

        let port = match number("PORT")? {
            Some(value) => u16::try_from(value).map_err(|_| ConfigError::Invalid {
                var: "PORT",
                value: value.to_string(),
            })?,
            None => 8000,
        };

        Ok(Self {
            taxonomy_snapshot_path,
            port,
            extract_concurrency: number("EXTRACT_CONCURRENCY")?
                .map(|value| (value as usize).clamp(1, MAX_EXTRACT_CONCURRENCY))
                .unwrap_or(5),
            llm_request_timeout: Duration::from_secs(
                number("LLM_REQUEST_TIMEOUT_SECS")?
                    .filter(|value| *value > 0)
                    .unwrap_or(60),
            ),
            match_sample_size: number("MATCH_SAMPLE_SIZE")?
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(25),
            match_candidates: number("MATCH_CANDIDATES")?
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(50),
            match_min_confidence,
            schema_inherit_from_ancestors,
            redis_url: var("REDIS_URL"),
            match_cache_ttl_secs: number("MATCH_CACHE_TTL_SECS")?.unwrap_or(0),
            api_keys: var("API_KEYS").unwrap_or_default(),
            request_max_bytes: number("REQUEST_MAX_BYTES")?
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(4 * 1024 * 1024),
            queue_capacity: number("QUEUE_CAPACITY")?
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(64),
            job_retention: number("JOB_RETENTION")?
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(256),
            http_timeout: Duration::from_secs(number("HTTP_TIMEOUT_SECS")?.unwrap_or(90)),
            http_connect_timeout: Duration::from_secs(
                number("HTTP_CONNECT_TIMEOUT_SECS")?.unwrap_or(5),
            ),
            llm: LlmSettings {
                gateway_url: var("TENSORZERO_GATEWAY_URL")
                    .unwrap_or_else(|| "http://localhost:3000".into()),
                api_key: var("TENSORZERO_API_KEY"),
                model: var("TENSORZERO_MODEL"),
                match_function: var("TENSORZERO_MATCH_FUNCTION")
                    .unwrap_or_else(|| "category_match".into()),
                extract_function: var("TENSORZERO_EXTRACT_FUNCTION")
                    .unwrap_or_else(|| "attribute_extraction".into()),
                max_attempts: number("LLM_MAX_ATTEMPTS")?
                    .filter(|value| *value > 0)
                    .map(|value| value.min(10) as u32)
                    .unwrap_or(3),
                retry_base: Duration::from_millis(number("LLM_RETRY_BASE_MS")?.unwrap_or(1000)),
            },
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
