//! Runtime settings, one explicit field per knob.
//!
//! Everything is read from the environment (after `dotenvy`) with sensible
//! defaults, so the binary starts with no configuration at all against a
//! local model server.

use crate::orchestrator::OrchestratorConfig;
use crate::throttle::ThrottleConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,

    // LLM server
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,

    // Throttling
    pub max_concurrent_requests: usize,
    pub requests_per_minute: usize,
    pub request_delay_ms: u64,
    pub target_response_time_ms: f64,
    pub enable_circuit_breaker: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,

    // Pattern library
    pub patterns_dir: PathBuf,
    pub entity_alias_file: PathBuf,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,

    // Routing
    pub max_context_length: usize,
    pub safety_margin: usize,
    pub chars_per_token: f64,
    pub force_strategy: Option<String>,

    // Orchestration
    pub wave_timeout: Duration,
    pub extraction_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let extraction_timeout_s: u64 = parse(&lookup, "EXTRACTION_TIMEOUT_SECONDS", 600)?;

        Ok(Self {
            port: parse(&lookup, "PORT", 3001)?,

            llm_base_url: lookup("LLM_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_string()),
            llm_model: lookup("LLM_MODEL").unwrap_or_else(|| "llama-3.1-8b-instruct".to_string()),
            llm_timeout: Duration::from_secs(parse(&lookup, "LLM_TIMEOUT_SECONDS", 120)?),
            llm_max_retries: parse(&lookup, "LLM_MAX_RETRIES", 1)?,

            max_concurrent_requests: parse(&lookup, "MAX_CONCURRENT_REQUESTS", 4)?,
            requests_per_minute: parse(&lookup, "REQUESTS_PER_MINUTE", 60)?,
            request_delay_ms: parse(&lookup, "REQUEST_DELAY_MS", 100)?,
            target_response_time_ms: parse(&lookup, "TARGET_RESPONSE_TIME_MS", 1000.0)?,
            enable_circuit_breaker: parse(&lookup, "ENABLE_CIRCUIT_BREAKER", true)?,
            failure_threshold: parse(&lookup, "FAILURE_THRESHOLD", 3)?,
            recovery_timeout: Duration::from_secs(parse(&lookup, "RECOVERY_TIMEOUT_SECONDS", 60)?),
            half_open_requests: parse(&lookup, "HALF_OPEN_REQUESTS", 1)?,

            patterns_dir: PathBuf::from(
                lookup("PATTERNS_DIR").unwrap_or_else(|| "patterns".to_string()),
            ),
            entity_alias_file: PathBuf::from(
                lookup("ENTITY_ALIAS_FILE")
                    .unwrap_or_else(|| "config/entity_type_aliases.json".to_string()),
            ),
            cache_max_size: parse(&lookup, "CACHE_MAX_SIZE", 128)?,
            cache_ttl: Duration::from_secs(parse(&lookup, "CACHE_TTL_SECONDS", 3600)?),

            max_context_length: parse(&lookup, "MAX_CONTEXT_LENGTH", 32_768)?,
            safety_margin: parse(&lookup, "SAFETY_MARGIN", 2_000)?,
            chars_per_token: parse(&lookup, "CHARS_PER_TOKEN", 4.0)?,
            force_strategy: lookup("FORCE_STRATEGY").filter(|s| !s.is_empty()),

            wave_timeout: Duration::from_secs(parse(&lookup, "WAVE_TIMEOUT_SECONDS", 120)?),
            extraction_timeout: (extraction_timeout_s > 0)
                .then(|| Duration::from_secs(extraction_timeout_s)),
        })
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrent: self.max_concurrent_requests,
            requests_per_minute: self.requests_per_minute,
            request_delay_ms: self.request_delay_ms,
            target_response_time_ms: self.target_response_time_ms,
            adaptation_rate: 0.1,
            enable_circuit_breaker: self.enable_circuit_breaker,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            half_open_requests: self.half_open_requests,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            chars_per_token: self.chars_per_token,
            wave_timeout: self.wave_timeout,
            extraction_timeout: self.extraction_timeout,
            ..Default::default()
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings.port, 3001);
        assert_eq!(settings.max_concurrent_requests, 4);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.chars_per_token, 4.0);
        assert_eq!(settings.patterns_dir, PathBuf::from("patterns"));
        assert_eq!(settings.extraction_timeout, Some(Duration::from_secs(600)));
        assert!(settings.force_strategy.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("LLM_BASE_URL", "http://llm:9000"),
            ("MAX_CONCURRENT_REQUESTS", "8"),
            ("REQUESTS_PER_MINUTE", "120"),
            ("FAILURE_THRESHOLD", "5"),
            ("FORCE_STRATEGY", "FOUR_WAVE"),
            ("EXTRACTION_TIMEOUT_SECONDS", "0"),
        ])
        .unwrap();

        assert_eq!(settings.llm_base_url, "http://llm:9000");
        assert_eq!(settings.max_concurrent_requests, 8);
        assert_eq!(settings.requests_per_minute, 120);
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.force_strategy.as_deref(), Some("FOUR_WAVE"));
        assert_eq!(settings.extraction_timeout, None);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let result = settings_from(&[("MAX_CONCURRENT_REQUESTS", "many")]);
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("MAX_CONCURRENT_REQUESTS"));
    }

    #[test]
    fn test_throttle_config_mapping() {
        let settings = settings_from(&[("REQUEST_DELAY_MS", "250")]).unwrap();
        let config = settings.throttle_config();
        assert_eq!(config.request_delay_ms, 250);
        assert_eq!(config.failure_threshold, 3);
        assert!(config.enable_circuit_breaker);
    }
}
