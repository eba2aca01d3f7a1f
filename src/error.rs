use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `fabula`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum FabulaError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── LLM gateway ─────────────────────────────────────────────────────
    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    // ── Memory ──────────────────────────────────────────────────────────
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    // ── Storage / repositories ──────────────────────────────────────────
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    // ── Session ─────────────────────────────────────────────────────────
    #[error("session: {0}")]
    Session(#[from] SessionError),

    // ── Setting extraction ──────────────────────────────────────────────
    #[error("extraction: {0}")]
    Extraction(#[from] ExtractionError),

    // ── Content generation ──────────────────────────────────────────────
    #[error("generation: {0}")]
    Generation(#[from] GenerationError),

    // ── Turn cancellation (not a fault; never logged as error) ──────────
    #[error("cancelled")]
    Cancelled,

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Flat error taxonomy surfaced to callers in reply envelopes.
///
/// Every `FabulaError` maps to exactly one kind; raw provider strings never
/// cross this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Timeout,
    RateLimit,
    Auth,
    ContextOverflow,
    ProviderError,
    Network,
    Storage,
    Parse,
    Validation,
    NotFound,
    ConcurrencyConflict,
    Cancelled,
}

impl ErrorKind {
    /// Whether a caller retrying the same call can reasonably expect success.
    #[must_use]
    pub const fn retryable(self) -> bool {
        match self {
            Self::Timeout
            | Self::RateLimit
            | Self::ProviderError
            | Self::Network
            | Self::Storage
            | Self::ConcurrencyConflict => true,
            Self::Config
            | Self::Auth
            | Self::ContextOverflow
            | Self::Parse
            | Self::Validation
            | Self::NotFound
            | Self::Cancelled => false,
        }
    }
}

impl FabulaError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Llm(err) => err.kind(),
            Self::Memory(MemoryError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Memory(MemoryError::Embedding(_)) => ErrorKind::ProviderError,
            Self::Memory(_) => ErrorKind::Storage,
            Self::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Storage(StorageError::Conflict(_)) => ErrorKind::ConcurrencyConflict,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Session(SessionError::NotFound(_)) => ErrorKind::NotFound,
            Self::Session(_) => ErrorKind::Storage,
            Self::Extraction(ExtractionError::Parse(_)) => ErrorKind::Parse,
            Self::Extraction(_) => ErrorKind::Validation,
            Self::Generation(GenerationError::Llm(err)) => err.kind(),
            Self::Generation(GenerationError::PromptOverflow { .. }) => ErrorKind::ContextOverflow,
            Self::Generation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other(_) => ErrorKind::ProviderError,
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── LLM gateway errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("provider {provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: String, elapsed_ms: u64 },

    #[error("provider {provider} rate-limited")]
    RateLimited { provider: String },

    #[error("provider {provider} authentication failed")]
    Auth { provider: String },

    #[error("prompt exceeds context window of provider {provider} ({tokens} > {window})")]
    ContextOverflow {
        provider: String,
        tokens: u32,
        window: u32,
    },

    #[error("provider {provider} request failed: {message}")]
    Provider { provider: String, message: String },

    #[error("network error reaching provider {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("streaming error from provider {provider}: {message}")]
    Streaming { provider: String, message: String },
}

impl LlmError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            Self::Provider { .. } | Self::Streaming { .. } => ErrorKind::ProviderError,
            Self::Network { .. } => ErrorKind::Network,
        }
    }

    /// Retry policy input: TIMEOUT, RATE_LIMIT, NETWORK and PROVIDER_ERROR
    /// retry; AUTH and CONTEXT_OVERFLOW do not.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Timeout { provider, .. }
            | Self::RateLimited { provider }
            | Self::Auth { provider }
            | Self::ContextOverflow { provider, .. }
            | Self::Provider { provider, .. }
            | Self::Network { provider, .. }
            | Self::Streaming { provider, .. } => provider,
        }
    }
}

// ─── Memory errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory item not found: {id}")]
    NotFound { id: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector store: {0}")]
    VectorStore(String),

    #[error("store: {0}")]
    Store(String),

    #[error("context budget too small: {0} tokens")]
    BudgetTooSmall(u32),
}

// ─── Storage errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("backend: {0}")]
    Backend(String),

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Session errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("eviction failed: {0}")]
    Eviction(String),

    #[error("store: {0}")]
    Store(String),
}

// ─── Setting extraction errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("completion output unparseable: {0}")]
    Parse(String),

    #[error("invalid setting edit: {0}")]
    InvalidEdit(String),
}

// ─── Content generation errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    #[error("prompt does not fit: {tokens} tokens against a {budget} token budget")]
    PromptOverflow { tokens: u32, budget: u32 },

    #[error("mode {mode} requires previous content")]
    MissingPreviousContent { mode: &'static str },

    #[error("chapter {chapter} has no current record")]
    NoCurrentRecord { chapter: u32 },
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, FabulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_timeout_maps_to_retryable_kind() {
        let err = FabulaError::Llm(LlmError::Timeout {
            provider: "openai".into(),
            elapsed_ms: 60_000,
        });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.retryable());
    }

    #[test]
    fn auth_and_context_overflow_are_not_retryable() {
        let auth = LlmError::Auth {
            provider: "anthropic".into(),
        };
        let overflow = LlmError::ContextOverflow {
            provider: "openai".into(),
            tokens: 9000,
            window: 8192,
        };
        assert!(!auth.retryable());
        assert!(!overflow.retryable());
    }

    #[test]
    fn storage_conflict_maps_to_concurrency_kind() {
        let err = FabulaError::Storage(StorageError::Conflict("chapter 3".into()));
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert!(err.retryable());
    }

    #[test]
    fn cancelled_is_terminal() {
        let err = FabulaError::Cancelled;
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.retryable());
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: FabulaError = anyhow_err.into();
        assert!(err.to_string().contains("something went wrong"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ContextOverflow).unwrap();
        assert_eq!(json, "\"context_overflow\"");
    }
}
