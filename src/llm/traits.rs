use super::streaming::{response_to_events, ChatStream};
use super::tokens::estimate_tokens;
use super::types::{ChatRequest, ChatResponse};
use crate::error::LlmError;
use async_trait::async_trait;
use futures_util::stream;

/// Uniform provider seam. Each implementation translates the request into
/// its native wire call and normalizes the result; none of them touch
/// memory or any other shared state.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "openai").
    fn name(&self) -> &str;

    /// Input+output token capacity of the configured model.
    fn context_window(&self) -> u32;

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Lazy chunk sequence. The default buffers a full response and replays
    /// it; HTTP providers override with native streaming.
    async fn generate_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(stream::iter(response_to_events(response))))
    }

    /// Token accounting. The default is the chars-per-token heuristic;
    /// providers with a real tokenizer override.
    fn count_tokens(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::streaming::StreamCollector;
    use crate::llm::types::ChatMessage;
    use futures_util::StreamExt;

    struct EchoProvider;

    #[async_trait]
    impl ChatProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn context_window(&self) -> u32 {
            4096
        }

        async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse::text_only(last))
        }
    }

    #[tokio::test]
    async fn default_stream_replays_generate() {
        let provider = EchoProvider;
        let request = ChatRequest::new(vec![ChatMessage::user("tell me a story")]);
        let mut stream = provider.generate_stream(&request).await.unwrap();

        let mut collector = StreamCollector::new();
        while let Some(event) = stream.next().await {
            collector.feed(&event.unwrap());
        }
        assert_eq!(collector.finish().content, "tell me a story");
    }

    #[test]
    fn default_count_tokens_uses_heuristic() {
        let provider = EchoProvider;
        assert_eq!(provider.count_tokens("abcdefgh"), 2);
    }
}
