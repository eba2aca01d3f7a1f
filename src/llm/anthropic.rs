use super::streaming::{ChatStream, StreamEvent};
use super::traits::ChatProvider;
use super::types::{ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use super::wire::{
    channel_stream, classify_send_error, error_for_response, http_client, SseBuffer,
};
use crate::error::LlmError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages-API provider. System prompts travel in the dedicated
/// `system` field; the message list must alternate user/assistant.
pub struct AnthropicProvider {
    client: reqwest::Client,
    messages_url: String,
    api_key: String,
    model: String,
    context_window: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, context_window: u32) -> Self {
        Self::with_base_url("https://api.anthropic.com", api_key, model, context_window)
    }

    pub fn with_base_url(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_window: u32,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: http_client(5),
            messages_url: format!("{base}/v1/messages"),
            api_key: api_key.into(),
            model: model.into(),
            context_window,
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let mut system_parts = Vec::new();
        let mut messages: Vec<WireMessage> = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(message.content.clone()),
                Role::User | Role::Assistant => {
                    let role = if message.role == Role::User {
                        "user"
                    } else {
                        "assistant"
                    };
                    // Merge consecutive same-role messages; the API rejects
                    // non-alternating sequences.
                    if let Some(last) = messages.last_mut() {
                        if last.role == role {
                            last.content.push_str("\n\n");
                            last.content.push_str(&message.content);
                            continue;
                        }
                    }
                    messages.push(WireMessage {
                        role,
                        content: message.content.clone(),
                    });
                }
            }
        }

        WireRequest {
            model: self.model.clone(),
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: if request.stop.is_empty() {
                None
            } else {
                Some(request.stop.clone())
            },
            stream,
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_body(request, stream))
            .send()
            .await
            .map_err(|e| classify_send_error("anthropic", &e))?;

        if !response.status().is_success() {
            return Err(error_for_response("anthropic", response).await);
        }
        Ok(response)
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        None | Some(_) => FinishReason::Stop,
    }
}

// ── Wire DTOs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: WireStreamMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: WireStreamDelta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        delta: WireStopDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct WireStreamMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireStopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.send(request, false).await?;
        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Provider {
            provider: "anthropic".into(),
            message: format!("malformed response: {e}"),
        })?;

        let content: String = wire
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        let usage = wire
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            usage,
            finish_reason: map_stop_reason(wire.stop_reason.as_deref()),
        })
    }

    async fn generate_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        let (tx, stream) = channel_stream(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf = SseBuffer::default();
            let mut input_tokens = 0;
            let mut output_tokens = 0;
            let mut finish_reason = FinishReason::Stop;

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Streaming {
                                provider: "anthropic".into(),
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };

                for data in buf.push(&bytes) {
                    let Ok(event) = serde_json::from_str::<WireStreamEvent>(&data) else {
                        continue;
                    };
                    match event {
                        WireStreamEvent::MessageStart { message } => {
                            if let Some(usage) = message.usage {
                                input_tokens = usage.input_tokens;
                            }
                            if tx
                                .send(Ok(StreamEvent::Start {
                                    model: message.model,
                                }))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        WireStreamEvent::ContentBlockDelta { delta } => {
                            if !delta.text.is_empty()
                                && tx
                                    .send(Ok(StreamEvent::Delta { text: delta.text }))
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                        }
                        WireStreamEvent::MessageDelta { delta, usage } => {
                            if let Some(usage) = usage {
                                output_tokens = usage.output_tokens;
                            }
                            if let Some(reason) = delta.stop_reason.as_deref() {
                                finish_reason = map_stop_reason(Some(reason));
                            }
                        }
                        WireStreamEvent::MessageStop => {
                            let _ = tx
                                .send(Ok(StreamEvent::Done {
                                    usage: TokenUsage::new(input_tokens, output_tokens),
                                    finish_reason,
                                }))
                                .await;
                            return;
                        }
                        WireStreamEvent::Ignored => {}
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamEvent::Done {
                    usage: TokenUsage::new(input_tokens, output_tokens),
                    finish_reason,
                }))
                .await;
        });

        Ok(stream)
    }
}
