use super::streaming::{ChatStream, StreamEvent};
use super::traits::ChatProvider;
use super::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use super::wire::{
    channel_stream, classify_send_error, error_for_response, http_client, SseBuffer,
};
use crate::error::LlmError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

/// How the API key travels. OpenAI proper and every compatible endpoint use
/// a bearer header; Azure uses its own `api-key` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
}

/// OpenAI chat-completions provider. Also serves Azure OpenAI (different
/// base URL and auth header, same wire shape) and any compatible endpoint.
pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    completions_url: String,
    api_key: String,
    auth_style: AuthStyle,
    model: String,
    context_window: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, context_window: u32) -> Self {
        Self::compatible(
            "openai",
            "https://api.openai.com",
            api_key,
            model,
            context_window,
        )
    }

    /// Any endpoint speaking the chat-completions shape.
    pub fn compatible(
        name: impl Into<String>,
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_window: u32,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            name: name.into(),
            client: http_client(5),
            completions_url: format!("{base}/v1/chat/completions"),
            api_key: api_key.into(),
            auth_style: AuthStyle::Bearer,
            model: model.into(),
            context_window,
        }
    }

    /// Azure OpenAI: the deployment URL already encodes the model, and the
    /// key goes in the `api-key` header.
    pub fn azure(
        resource_url: &str,
        deployment: &str,
        api_version: &str,
        api_key: impl Into<String>,
        context_window: u32,
    ) -> Self {
        let base = resource_url.trim_end_matches('/');
        Self {
            name: "azure-openai".into(),
            client: http_client(5),
            completions_url: format!(
                "{base}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            ),
            api_key: api_key.into(),
            auth_style: AuthStyle::ApiKeyHeader,
            model: deployment.into(),
            context_window,
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: role_label(m.role),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: if request.stop.is_empty() {
                None
            } else {
                Some(request.stop.clone())
            },
            stream,
            stream_options: stream.then(|| StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthStyle::ApiKeyHeader => builder.header("api-key", self.api_key.clone()),
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = self.build_body(request, stream);
        let response = self
            .apply_auth(self.client.post(&self.completions_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.name, &e))?;

        if !response.status().is_success() {
            return Err(error_for_response(&self.name, response).await);
        }
        Ok(response)
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        None | Some(_) => FinishReason::Stop,
    }
}

// ── Wire DTOs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.send(request, false).await?;
        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Provider {
            provider: self.name.clone(),
            message: format!("malformed response: {e}"),
        })?;

        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            LlmError::Provider {
                provider: self.name.clone(),
                message: "response carried no choices".into(),
            }
        })?;

        let usage = wire
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    async fn generate_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        let provider = self.name.clone();
        let (tx, stream) = channel_stream(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf = SseBuffer::default();
            let mut started = false;
            let mut usage = TokenUsage::default();
            let mut finish_reason = FinishReason::Stop;
            let mut done_sent = false;

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Streaming {
                                provider: provider.clone(),
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };

                for data in buf.push(&bytes) {
                    if data == "[DONE]" {
                        if tx
                            .send(Ok(StreamEvent::Done {
                                usage,
                                finish_reason,
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        done_sent = true;
                        continue;
                    }

                    let Ok(parsed) = serde_json::from_str::<WireChunk>(&data) else {
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

                    if let Some(u) = parsed.usage {
                        usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
                    }

                    for choice in parsed.choices {
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            finish_reason = map_finish_reason(Some(reason));
                        }
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty()
                                && tx.send(Ok(StreamEvent::Delta { text })).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }

            if !done_sent {
                let _ = tx
                    .send(Ok(StreamEvent::Done {
                        usage,
                        finish_reason,
                    }))
                    .await;
            }
        });

        Ok(stream)
    }
}
