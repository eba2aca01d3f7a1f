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

/// Google Gemini provider over the `generateContent` REST surface.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: u32,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, context_window: u32) -> Self {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com",
            api_key,
            model,
            context_window,
        )
    }

    pub fn with_base_url(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_window: u32,
    ) -> Self {
        Self {
            client: http_client(5),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            context_window,
        }
    }

    fn url(&self, method: &str, sse: bool) -> String {
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/v1beta/models/{}:{method}?{alt}key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_body(&self, request: &ChatRequest) -> WireRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(message.content.clone()),
                Role::User | Role::Assistant => contents.push(WireContent {
                    role: if message.role == Role::User {
                        "user"
                    } else {
                        "model"
                    },
                    parts: vec![WirePart {
                        text: message.content.clone(),
                    }],
                }),
            }
        }

        WireRequest {
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(WireSystemInstruction {
                    parts: vec![WirePart {
                        text: system_parts.join("\n\n"),
                    }],
                })
            },
            contents,
            generation_config: WireGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                top_p: request.top_p,
                stop_sequences: if request.stop.is_empty() {
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
        method: &str,
        sse: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(self.url(method, sse))
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| classify_send_error("gemini", &e))?;

        if !response.status().is_success() {
            return Err(error_for_response("gemini", response).await);
        }
        Ok(response)
    }
}

fn extract_text(candidate: &WireCandidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .map(|part| part.text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST") => FinishReason::ContentFilter,
        None | Some(_) => FinishReason::Stop,
    }
}

fn usage_from_metadata(metadata: Option<&WireUsageMetadata>) -> TokenUsage {
    metadata
        .map(|m| TokenUsage::new(m.prompt_token_count, m.candidates_token_count))
        .unwrap_or_default()
}

// ── Wire DTOs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireSystemInstruction>,
    contents: Vec<WireContent>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireSystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCandidateContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.send(request, "generateContent", false).await?;
        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Provider {
            provider: "gemini".into(),
            message: format!("malformed response: {e}"),
        })?;

        let candidate = wire.candidates.first().ok_or_else(|| LlmError::Provider {
            provider: "gemini".into(),
            message: "response carried no candidates".into(),
        })?;

        Ok(ChatResponse {
            content: extract_text(candidate),
            usage: usage_from_metadata(wire.usage_metadata.as_ref()),
            finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
        })
    }

    async fn generate_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, "streamGenerateContent", true).await?;
        let (tx, stream) = channel_stream(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf = SseBuffer::default();
            let mut started = false;
            let mut usage = TokenUsage::default();
            let mut finish_reason = FinishReason::Stop;

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Streaming {
                                provider: "gemini".into(),
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };

                for data in buf.push(&bytes) {
                    let Ok(parsed) = serde_json::from_str::<WireResponse>(&data) else {
                        continue;
                    };

                    if !started {
                        started = true;
                        if tx
                            .send(Ok(StreamEvent::Start {
                                model: parsed.model_version.clone(),
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(metadata) = parsed.usage_metadata {
                        usage = usage_from_metadata(Some(&metadata));
                    }

                    for candidate in &parsed.candidates {
                        if let Some(reason) = candidate.finish_reason.as_deref() {
                            finish_reason = map_finish_reason(Some(reason));
                        }
                        let text = extract_text(candidate);
                        if !text.is_empty()
                            && tx.send(Ok(StreamEvent::Delta { text })).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamEvent::Done {
                    usage,
                    finish_reason,
                }))
                .await;
        });

        Ok(stream)
    }
}
