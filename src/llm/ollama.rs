use super::streaming::{ChatStream, StreamEvent};
use super::traits::ChatProvider;
use super::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use super::wire::{channel_stream, classify_send_error, error_for_response, NdjsonBuffer};
use crate::error::LlmError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

/// Local Ollama provider. Generation runs on the caller's hardware, so the
/// connect timeout stays short while the client itself carries no overall
/// deadline.
pub struct OllamaProvider {
    client: reqwest::Client,
    chat_url: String,
    model: String,
    context_window: u32,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, model: impl Into<String>, context_window: u32) -> Self {
        let base = base_url
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/');
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(std::time::Duration::from_secs(90))
                .tcp_keepalive(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            chat_url: format!("{base}/api/chat"),
            model: model.into(),
            context_window,
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(wire_message).collect(),
            stream,
            options: WireOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: request.top_p,
                stop: if request.stop.is_empty() {
                    None
                } else {
                    Some(request.stop.clone())
                },
            },
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.chat_url)
            .json(&self.build_body(request, stream))
            .send()
            .await
            .map_err(|e| classify_send_error("ollama", &e))?;

        if !response.status().is_success() {
            return Err(error_for_response("ollama", response).await);
        }
        Ok(response)
    }
}

fn wire_message(message: &ChatMessage) -> WireMessage {
    WireMessage {
        role: match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        },
        content: message.content.clone(),
    }
}

fn usage_from(response: &WireResponse) -> TokenUsage {
    TokenUsage::new(
        response.prompt_eval_count.unwrap_or(0),
        response.eval_count.unwrap_or(0),
    )
}

// ── Wire DTOs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    temperature: f64,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<WireResponseMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.send(request, false).await?;
        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Provider {
            provider: "ollama".into(),
            message: format!("malformed response: {e}"),
        })?;

        Ok(ChatResponse {
            content: wire.message.as_ref().map_or(String::new(), |m| m.content.clone()),
            usage: usage_from(&wire),
            finish_reason: FinishReason::Stop,
        })
    }

    async fn generate_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        let (tx, stream) = channel_stream(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf = NdjsonBuffer::default();
            let mut started = false;
            let mut usage = TokenUsage::default();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Streaming {
                                provider: "ollama".into(),
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };

                for line in buf.push(&bytes) {
                    let Ok(parsed) = serde_json::from_str::<WireResponse>(&line) else {
                        continue;
                    };

                    if !started {
                        started = true;
                        if tx
                            .send(Ok(StreamEvent::Start {
                                model: parsed.model.clone(),
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(message) = &parsed.message {
                        if !message.content.is_empty()
                            && tx
                                .send(Ok(StreamEvent::Delta {
                                    text: message.content.clone(),
                                }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    if parsed.done {
                        usage = usage_from(&parsed);
                        let _ = tx
                            .send(Ok(StreamEvent::Done {
                                usage,
                                finish_reason: FinishReason::Stop,
                            }))
                            .await;
                        return;
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamEvent::Done {
                    usage,
                    finish_reason: FinishReason::Stop,
                }))
                .await;
        });

        Ok(stream)
    }
}
