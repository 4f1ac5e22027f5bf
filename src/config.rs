//! Runtime configuration
//!
//! Endpoint credentials come from the environment (via dotenv in the
//! binary); tuning knobs come from the caller, normally the CLI.

use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{ExtractionError, Result};
use crate::limiter::LimiterConfig;
use crate::recovery::RecoveryConfig;

pub const DEFAULT_MODEL: &str = "qwen/qwen3-4b-2507";
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Whether missing fields in an LLM extraction are backfilled from the
/// rule-based extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrichMode {
    Off,
    #[default]
    Safe,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub retry_backoff_base: f64,
    pub request_timeout: Duration,
}

impl LlmConfig {
    /// Read endpoint settings from `API_URL` / `API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("API_URL").map_err(|_| {
            ExtractionError::ConfigError(
                "API_URL is not set; export it or pass --no-llm".to_string(),
            )
        })?;
        let api_key = std::env::var("API_KEY").ok();
        Ok(Self {
            api_url,
            api_key,
            ..Self::local_default()
        })
    }

    /// Defaults for a local OpenAI-compatible endpoint.
    pub fn local_default() -> Self {
        Self {
            api_url: "http://localhost:1234/v1/chat/completions".to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_attempts: 3,
            retry_backoff_base: 2.0,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base batch size before adaptive adjustment.
    pub batch_size: usize,
    /// How many batches run concurrently in one group.
    pub parallel_batches: usize,
    /// Wall-clock budget for a single message end to end.
    pub message_timeout: Duration,
    /// Pause between sequential batch groups.
    pub inter_group_pause: Duration,
    /// Extractions below this confidence are treated as failures.
    pub min_confidence: f64,
    pub enrich: EnrichMode,
    pub use_llm: bool,
    pub limiter: LimiterConfig,
    pub recovery: RecoveryConfig,
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            parallel_batches: 3,
            message_timeout: Duration::from_secs(30),
            inter_group_pause: Duration::from_secs(5),
            min_confidence: 0.3,
            enrich: EnrichMode::Safe,
            use_llm: true,
            limiter: LimiterConfig::default(),
            recovery: RecoveryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}
