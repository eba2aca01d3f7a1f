use super::retry::RetryPolicy;
use super::streaming::{CancelToken, CancellableStream, ChatStream};
use super::traits::ChatProvider;
use super::types::{ChatRequest, ChatResponse};
use crate::config::Config;
use crate::error::LlmError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Provider-agnostic gateway: retry, timeout, token accounting and
/// per-provider backpressure around a single `ChatProvider`.
///
/// The gateway never mutates memory; its only state is the admission
/// bookkeeping.
pub struct LlmGateway {
    provider: Arc<dyn ChatProvider>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth_limit: usize,
    call_timeout: Duration,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn ChatProvider>, config: &Config) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default().with_max_attempts(config.retry_max_attempts),
            permits: Arc::new(Semaphore::new(config.per_provider_concurrency)),
            waiting: AtomicUsize::new(0),
            queue_depth_limit: config.queue_depth_limit,
            call_timeout: config.timeouts.llm(),
        }
    }

    /// Override the retry policy (mostly for tight test timings).
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    #[must_use]
    pub fn context_window(&self) -> u32 {
        self.provider.context_window()
    }

    #[must_use]
    pub fn count_tokens(&self, text: &str) -> u32 {
        self.provider.count_tokens(text)
    }

    /// One complete generation, retried per policy. Auth and context
    /// overflow surface immediately; everything retryable backs off with
    /// jitter up to the attempt cap.
    pub async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.check_window(request)?;
        let _permit = self.admit().await?;
        let timeout = request.timeout.unwrap_or(self.call_timeout);

        let mut attempt = 0;
        loop {
            match self.attempt_generate(request, timeout).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = self.provider.name(),
                            attempt,
                            "provider recovered after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt, &error) {
                        return Err(error);
                    }
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Open a native stream. Connection establishment is retried per
    /// policy; once chunks flow, failures surface to the consumer as
    /// stream items. The returned stream checks `cancel` between chunks
    /// and drops the provider connection as soon as it flips.
    pub async fn generate_stream(
        &self,
        request: &ChatRequest,
        cancel: CancelToken,
    ) -> Result<ChatStream, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Streaming {
                provider: self.provider.name().to_string(),
                message: "cancelled before dispatch".into(),
            });
        }

        self.check_window(request)?;
        let permit = self.admit().await?;

        let mut attempt = 0;
        let inner = loop {
            match self.provider.generate_stream(request).await {
                Ok(stream) => break stream,
                Err(error) => {
                    if cancel.is_cancelled() || !self.policy.should_retry(attempt, &error) {
                        return Err(error);
                    }
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                    attempt += 1;
                }
            }
        };

        Ok(Box::pin(CancellableStream::new(inner, cancel, permit)))
    }

    async fn attempt_generate(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, LlmError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.provider.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: self.provider.name().to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// A prompt sized exactly at the window is accepted; anything larger is
    /// rejected before any network traffic.
    fn check_window(&self, request: &ChatRequest) -> Result<(), LlmError> {
        let tokens = self.provider.count_tokens(&request.flat_text());
        let window = self.provider.context_window();
        if tokens > window {
            return Err(LlmError::ContextOverflow {
                provider: self.provider.name().to_string(),
                tokens,
                window,
            });
        }
        Ok(())
    }

    /// Admission control: bounded queue in front of the concurrency
    /// semaphore. Past the depth limit, fail fast with RATE_LIMIT instead
    /// of queueing unboundedly.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, LlmError> {
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth_limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(
                provider = self.provider.name(),
                limit = self.queue_depth_limit,
                "request queue saturated, failing fast"
            );
            return Err(LlmError::RateLimited {
                provider: self.provider.name().to_string(),
            });
        }

        let acquired = Arc::clone(&self.permits).acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        acquired.map_err(|_| LlmError::Provider {
            provider: self.provider.name().to_string(),
            message: "gateway shut down".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockProvider;
    use crate::llm::streaming::{StreamCollector, StreamEvent};
    use crate::llm::types::ChatMessage;
    use futures_util::StreamExt;

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("write something")])
    }

    fn fast_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn generate_returns_scripted_reply() {
        let provider = Arc::new(MockProvider::new().with_reply("chapter one"));
        let gateway = LlmGateway::new(provider, &fast_config());
        let response = gateway.generate(&request()).await.unwrap();
        assert_eq!(response.content, "chapter one");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let provider = Arc::new(
            MockProvider::new()
                .with_failures(2)
                .with_reply("recovered"),
        );
        let mut config = fast_config();
        config.retry_max_attempts = 3;
        let gateway = LlmGateway::new(provider.clone(), &config).with_retry_policy(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        let response = gateway.generate(&request()).await.unwrap();
        assert_eq!(response.content, "recovered");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn auth_failure_not_retried() {
        let provider = Arc::new(MockProvider::new().with_auth_failure());
        let gateway = LlmGateway::new(provider.clone(), &fast_config());
        let error = gateway.generate(&request()).await.unwrap_err();
        assert!(matches!(error, LlmError::Auth { .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn stream_cancellation_stops_chunks() {
        let provider = Arc::new(MockProvider::new().with_reply("a long streamed chapter"));
        let gateway = LlmGateway::new(provider, &fast_config());
        let cancel = CancelToken::new();

        let mut stream = gateway
            .generate_stream(&request(), cancel.clone())
            .await
            .unwrap();

        // First event flows, then cancellation cuts the stream.
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_collects_full_reply_when_uncancelled() {
        let provider = Arc::new(MockProvider::new().with_reply("streamed"));
        let gateway = LlmGateway::new(provider, &fast_config());
        let mut stream = gateway
            .generate_stream(&request(), CancelToken::new())
            .await
            .unwrap();

        let mut collector = StreamCollector::new();
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            let event = event.unwrap();
            if matches!(event, StreamEvent::Done { .. }) {
                saw_done = true;
            }
            collector.feed(&event);
        }
        assert!(saw_done);
        assert_eq!(collector.finish().content, "streamed");
    }

    #[tokio::test]
    async fn oversized_prompt_rejected_before_dispatch() {
        let provider = Arc::new(MockProvider::new().with_context_window(4));
        let gateway = LlmGateway::new(provider.clone(), &fast_config());
        // 40 latin chars ≈ 10 tokens against a 4 token window.
        let request = ChatRequest::new(vec![ChatMessage::user("x".repeat(40))]);
        let error = gateway.generate(&request).await.unwrap_err();
        assert!(matches!(error, LlmError::ContextOverflow { .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn exact_window_prompt_accepted() {
        let provider = Arc::new(MockProvider::new().with_context_window(10).with_reply("ok"));
        let gateway = LlmGateway::new(provider, &fast_config());
        let request = ChatRequest::new(vec![ChatMessage::user("x".repeat(40))]);
        assert!(gateway.generate(&request).await.is_ok());
    }

    #[tokio::test]
    async fn queue_saturation_fails_fast() {
        // Zero queue depth: the first waiter is already over the limit.
        let provider = Arc::new(MockProvider::new().with_reply("x"));
        let mut config = fast_config();
        config.queue_depth_limit = 0;
        let gateway = LlmGateway::new(provider, &config);
        let error = gateway.generate(&request()).await.unwrap_err();
        assert!(matches!(error, LlmError::RateLimited { .. }));
    }
}
