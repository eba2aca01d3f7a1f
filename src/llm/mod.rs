// Provider-agnostic LLM gateway: uniform request/response, retries with
// backoff, per-provider backpressure and cancellable streaming.

pub mod anthropic;
pub mod factory;
pub mod gateway;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod retry;
pub mod streaming;
pub mod tokens;
pub mod traits;
mod wire;

pub mod types;

pub use factory::create_provider;
pub use gateway::LlmGateway;
pub use mock::MockProvider;
pub use retry::RetryPolicy;
pub use streaming::{CancelToken, ChatStream, StreamCollector, StreamEvent};
pub use tokens::{estimate_tokens, is_cjk, tail_within_tokens};
pub use traits::ChatProvider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
