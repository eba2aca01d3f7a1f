use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

/// Process-wide configuration, loaded once at init and threaded through
/// `AgentContext`. No ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which LLM provider to use ("openai", "anthropic", "gemini",
    /// "azure-openai", "ollama", "mock").
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model identifier passed to the provider.
    #[serde(default)]
    pub model: Option<String>,

    /// Explicit API key; falls back to provider env vars when unset.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Override base URL (OpenAI-compatible endpoints, Azure resource URL,
    /// Ollama host).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Max prompt tokens the model accepts (input + output capacity).
    #[serde(default = "default_context_window")]
    pub context_window: u32,

    /// Sampling temperature for chapter prose.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-session turn bound; older turns are summarized and evicted.
    #[serde(default = "default_session_turn_cap")]
    pub session_turn_cap: usize,

    /// Minimum completeness score for the creation decision to auto-generate.
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,

    /// Minimum consistency score below which generation is blocked.
    #[serde(default = "default_consistency_threshold")]
    pub consistency_threshold: f64,

    /// Default k for memory search.
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,

    /// Per-chapter completion token cap.
    #[serde(default = "default_generation_max_tokens")]
    pub generation_max_tokens: u32,

    /// LLM retry cap (attempts, including the first).
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Parallel in-flight LLM calls per provider.
    #[serde(default = "default_per_provider_concurrency")]
    pub per_provider_concurrency: usize,

    /// Queued requests beyond which new calls fail fast with RATE_LIMIT.
    #[serde(default = "default_queue_depth_limit")]
    pub queue_depth_limit: usize,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub consistency: ConsistencyWeights,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_context_window() -> u32 {
    8192
}
fn default_temperature() -> f64 {
    0.8
}
fn default_session_turn_cap() -> usize {
    50
}
fn default_completion_threshold() -> f64 {
    0.7
}
fn default_consistency_threshold() -> f64 {
    0.5
}
fn default_retrieval_k() -> usize {
    8
}
fn default_generation_max_tokens() -> u32 {
    3500
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_per_provider_concurrency() -> usize {
    8
}
fn default_queue_depth_limit() -> usize {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            base_url: None,
            context_window: default_context_window(),
            temperature: default_temperature(),
            session_turn_cap: default_session_turn_cap(),
            completion_threshold: default_completion_threshold(),
            consistency_threshold: default_consistency_threshold(),
            retrieval_k: default_retrieval_k(),
            generation_max_tokens: default_generation_max_tokens(),
            retry_max_attempts: default_retry_max_attempts(),
            per_provider_concurrency: default_per_provider_concurrency(),
            queue_depth_limit: default_queue_depth_limit(),
            timeouts: TimeoutConfig::default(),
            memory: MemoryConfig::default(),
            consistency: ConsistencyWeights::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate numeric ranges the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.trim().is_empty() {
            return Err(ConfigError::Validation("provider must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.completion_threshold) {
            return Err(ConfigError::Validation(
                "completion_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consistency_threshold) {
            return Err(ConfigError::Validation(
                "consistency_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(
                "temperature must be in [0, 2]".into(),
            ));
        }
        if self.context_window == 0 {
            return Err(ConfigError::Validation(
                "context_window must be positive".into(),
            ));
        }
        if self.session_turn_cap == 0 {
            return Err(ConfigError::Validation(
                "session_turn_cap must be positive".into(),
            ));
        }
        if self.per_provider_concurrency == 0 {
            return Err(ConfigError::Validation(
                "per_provider_concurrency must be positive".into(),
            ));
        }
        if self.generation_max_tokens > self.context_window {
            return Err(ConfigError::Validation(
                "generation_max_tokens exceeds context_window".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the API key: explicit config first, then provider env vars,
    /// then the generic fallbacks.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }

        let provider_env_candidates: &[&str] = match self.provider.as_str() {
            "openai" => &["OPENAI_API_KEY"],
            "azure-openai" | "azure" => &["AZURE_OPENAI_API_KEY", "OPENAI_API_KEY"],
            "anthropic" | "claude" => &["ANTHROPIC_API_KEY"],
            "gemini" | "google" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            _ => &[],
        };

        for env_var in provider_env_candidates {
            if let Ok(value) = std::env::var(env_var) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }

        for env_var in ["FABULA_API_KEY", "API_KEY"] {
            if let Ok(value) = std::env::var(env_var) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }

        None
    }
}

// ── Timeouts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-turn wall clock, seconds.
    #[serde(default = "default_turn_secs")]
    pub turn_secs: u64,

    /// Per LLM call, seconds.
    #[serde(default = "default_llm_secs")]
    pub llm_secs: u64,

    /// Per vector-store query, seconds.
    #[serde(default = "default_vector_secs")]
    pub vector_secs: u64,
}

fn default_turn_secs() -> u64 {
    120
}
fn default_llm_secs() -> u64 {
    60
}
fn default_vector_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            turn_secs: default_turn_secs(),
            llm_secs: default_llm_secs(),
            vector_secs: default_vector_secs(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn turn(&self) -> Duration {
        Duration::from_secs(self.turn_secs)
    }

    #[must_use]
    pub const fn llm(&self) -> Duration {
        Duration::from_secs(self.llm_secs)
    }

    #[must_use]
    pub const fn vector(&self) -> Duration {
        Duration::from_secs(self.vector_secs)
    }
}

// ── Memory ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// CONTEXT-level ring buffer bound (recent chapters + dialogue).
    #[serde(default = "default_context_items_cap")]
    pub context_items_cap: usize,

    /// Embedding provider ("none", "openai", "custom:<base-url>").
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    /// Embedding model identifier.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Embedding dimensions.
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

fn default_context_items_cap() -> usize {
    12
}
fn default_embedding_provider() -> String {
    "none".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_dims() -> usize {
    1536
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_items_cap: default_context_items_cap(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            embedding_dims: default_embedding_dims(),
        }
    }
}

// ── Consistency scoring weights ──────────────────────────────────

/// Penalty weights for the consistency score. The defaults come from the
/// original scoring rule; they are tunable, the formula is not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsistencyWeights {
    #[serde(default = "default_error_weight")]
    pub error: f64,

    #[serde(default = "default_warn_weight")]
    pub warn: f64,

    #[serde(default = "default_info_weight")]
    pub info: f64,
}

fn default_error_weight() -> f64 {
    0.3
}
fn default_warn_weight() -> f64 {
    0.1
}
fn default_info_weight() -> f64 {
    0.02
}

impl Default for ConsistencyWeights {
    fn default() -> Self {
        Self {
            error: default_error_weight(),
            warn: default_warn_weight(),
            info: default_info_weight(),
        }
    }
}
