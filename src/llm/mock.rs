use super::tokens::estimate_tokens;
use super::traits::ChatProvider;
use super::types::{ChatRequest, ChatResponse, FinishReason, TokenUsage};
use crate::error::LlmError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted provider for tests and offline runs.
///
/// Replies are consumed in push order; when the script runs dry the default
/// reply is returned. Failure injection burns through `failures` transient
/// errors before the script resumes.
pub struct MockProvider {
    replies: Mutex<VecDeque<String>>,
    default_reply: String,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    fail_auth: bool,
    context_window: u32,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: "Understood. Tell me more about your story.".into(),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            fail_auth: false,
            context_window: 8192,
        }
    }

    /// Queue one scripted reply (FIFO).
    #[must_use]
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push_reply(reply);
        self
    }

    /// Replace the reply used once the script is exhausted.
    #[must_use]
    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Inject `n` transient provider failures before any reply succeeds.
    #[must_use]
    pub fn with_failures(self, n: usize) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Every call fails with an auth error.
    #[must_use]
    pub fn with_auth_failure(mut self) -> Self {
        self.fail_auth = true;
        self
    }

    #[must_use]
    pub fn with_context_window(mut self, window: u32) -> Self {
        self.context_window = window;
        self
    }

    /// Queue a reply after construction (sessions share the provider).
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(reply.into());
    }

    /// Total `generate` invocations, including injected failures.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests captured so far, in call order.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The most recent request, if any call was made.
    #[must_use]
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());

        if self.fail_auth {
            return Err(LlmError::Auth {
                provider: "mock".into(),
            });
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(LlmError::Provider {
                provider: "mock".into(),
                message: "injected transient failure".into(),
            });
        }

        let content = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        let usage = TokenUsage::new(
            estimate_tokens(&request.flat_text()),
            estimate_tokens(&content),
        );
        Ok(ChatResponse {
            content,
            usage,
            finish_reason: FinishReason::Stop,
        })
    }
}
