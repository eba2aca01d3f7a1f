use crate::consistency::ConsistencyReport;
use crate::error::{ErrorKind, FabulaError};
use crate::intent::IntentKind;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Chapter artifact attached to a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPayload {
    pub record_id: String,
    pub chapter_number: u32,
    pub content: String,
    pub word_count: u32,
    /// True when this call joined another caller's in-flight generation.
    #[serde(default)]
    pub coalesced: bool,
}

/// Caller-facing failure envelope. Raw provider strings never appear here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl From<&FabulaError> for ErrorEnvelope {
    fn from(error: &FabulaError) -> Self {
        Self {
            kind: error.kind(),
            retryable: error.retryable(),
        }
    }
}

/// What every turn returns. The agent always produces one of these; on
/// unrecoverable failure `text` is neutral and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub session_id: String,
    pub text: String,
    pub intent: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<GeneratedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl ChatReply {
    #[must_use]
    pub fn failure(session_id: impl Into<String>, error: &FabulaError) -> Self {
        Self {
            session_id: session_id.into(),
            text: "Something went wrong on my side; please try again.".into(),
            intent: IntentKind::Chat,
            generated: None,
            consistency: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

/// Streaming turn events, in wire order:
/// `token* (consistency? artifact?)? (done | error)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatEvent {
    Token(String),
    Artifact(GeneratedPayload),
    Consistency(ConsistencyReport),
    Done(ChatReply),
    Error(ErrorEnvelope),
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send + 'static>>;
