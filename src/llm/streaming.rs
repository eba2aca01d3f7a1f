use super::types::{ChatResponse, FinishReason, TokenUsage};
use crate::error::LlmError;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>>;

/// Incremental generation events. Every well-formed stream is
/// `Start, Delta*, Done`; consumers may stop polling at any point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        model: Option<String>,
    },
    Delta {
        text: String,
    },
    Done {
        usage: TokenUsage,
        finish_reason: FinishReason,
    },
}

/// Cooperative cancellation flag. The gateway checks it between chunks and
/// before committing to a new provider call; flipping it aborts the
/// underlying connection by dropping the provider stream.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Accumulates stream events back into a full `ChatResponse`.
#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl StreamCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Start { .. } => {}
            StreamEvent::Delta { text } => self.text.push_str(text),
            StreamEvent::Done {
                usage,
                finish_reason,
            } => {
                self.usage = *usage;
                self.finish_reason = Some(*finish_reason);
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> ChatResponse {
        ChatResponse {
            content: self.text,
            usage: self.usage,
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Stop),
        }
    }
}

/// Replay a complete response as the canonical event sequence. Used by the
/// default `generate_stream` implementation and by the mock provider.
#[must_use]
pub fn response_to_events(response: ChatResponse) -> Vec<Result<StreamEvent, LlmError>> {
    let mut events = vec![Ok(StreamEvent::Start { model: None })];
    if !response.content.is_empty() {
        events.push(Ok(StreamEvent::Delta {
            text: response.content,
        }));
    }
    events.push(Ok(StreamEvent::Done {
        usage: response.usage,
        finish_reason: response.finish_reason,
    }));
    events
}

/// Stream adapter that stops polling the inner stream once the token is
/// cancelled. Dropping the inner stream releases the provider connection;
/// the permit guard keeps the per-provider slot held until then.
pub(crate) struct CancellableStream<G> {
    inner: Option<ChatStream>,
    cancel: CancelToken,
    _guard: G,
}

impl<G> CancellableStream<G> {
    pub(crate) fn new(inner: ChatStream, cancel: CancelToken, guard: G) -> Self {
        Self {
            inner: Some(inner),
            cancel,
            _guard: guard,
        }
    }
}

impl<G: Unpin> Stream for CancellableStream<G> {
    type Item = Result<StreamEvent, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            // Drop the provider stream immediately so the connection is
            // released, then terminate.
            this.inner = None;
            return Poll::Ready(None);
        }
        match this.inner.as_mut() {
            Some(inner) => {
                let polled = inner.as_mut().poll_next(cx);
                if matches!(polled, Poll::Ready(None)) {
                    this.inner = None;
                }
                polled
            }
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[test]
    fn collector_rebuilds_response() {
        let mut collector = StreamCollector::new();
        collector.feed(&StreamEvent::Start { model: None });
        collector.feed(&StreamEvent::Delta {
            text: "once upon ".into(),
        });
        collector.feed(&StreamEvent::Delta {
            text: "a time".into(),
        });
        collector.feed(&StreamEvent::Done {
            usage: TokenUsage::new(12, 4),
            finish_reason: FinishReason::Stop,
        });
        let response = collector.finish();
        assert_eq!(response.content, "once upon a time");
        assert_eq!(response.usage.total, 16);
    }

    #[test]
    fn replay_produces_start_delta_done() {
        let events = response_to_events(ChatResponse::text_only("hi"));
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Ok(StreamEvent::Start { .. })));
        assert!(matches!(events[1], Ok(StreamEvent::Delta { .. })));
        assert!(matches!(events[2], Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn replay_skips_empty_delta() {
        let events = response_to_events(ChatResponse::text_only(""));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn cancellable_stream_stops_after_cancel() {
        let inner: ChatStream = Box::pin(stream::iter(vec![
            Ok(StreamEvent::Delta { text: "a".into() }),
            Ok(StreamEvent::Delta { text: "b".into() }),
            Ok(StreamEvent::Delta { text: "c".into() }),
        ]));
        let cancel = CancelToken::new();
        let mut wrapped = CancellableStream::new(inner, cancel.clone(), ());

        let first = wrapped.next().await;
        assert!(first.is_some());
        cancel.cancel();
        assert!(wrapped.next().await.is_none());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
