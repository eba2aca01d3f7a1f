// Two-stage intent recognition: keyword rules first, gateway fallback when
// the rules are unsure. Stateless between turns.

use crate::llm::{ChatMessage, ChatRequest, LlmGateway};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Closed label set driving the agent's routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CreateStory,
    ModifySetting,
    ModifyContent,
    Query,
    GenerateContent,
    ContinueContent,
    Chat,
}

impl IntentKind {
    pub const ALL: [Self; 7] = [
        Self::CreateStory,
        Self::ModifySetting,
        Self::ModifyContent,
        Self::Query,
        Self::GenerateContent,
        Self::ContinueContent,
        Self::Chat,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateStory => "create_story",
            Self::ModifySetting => "modify_setting",
            Self::ModifyContent => "modify_content",
            Self::Query => "query",
            Self::GenerateContent => "generate_content",
            Self::ContinueContent => "continue_content",
            Self::Chat => "chat",
        }
    }

    /// Whether this intent feeds the setting extraction pipeline.
    #[must_use]
    pub const fn updates_settings(self) -> bool {
        matches!(
            self,
            Self::CreateStory | Self::ModifySetting | Self::ModifyContent
        )
    }
}

/// Which parts of the setting a turn talks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingTopic {
    Character,
    World,
    Plot,
    Style,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: IntentKind,
    pub confidence: f64,
    pub rationale: String,
}

// Keyword tables, English plus the common Chinese phrasings.

const CONTINUE_CUES: &[&str] = &[
    "continue",
    "keep going",
    "next chapter",
    "what happens next",
    "go on",
    "继续",
    "接着写",
    "写下去",
    "下一章",
];

const MODIFY_CONTENT_CUES: &[&str] = &[
    "rewrite", "redo", "revise", "rework", "expand", "shorten", "重写", "改写", "扩写", "缩写",
];

const CREATE_STORY_SUBJECTS: &[&str] = &["novel", "story", "book", "saga", "小说", "故事"];
const CREATE_STORY_VERBS: &[&str] = &[
    "want", "new", "start", "create", "begin", "write a", "write an", "想写", "我要写", "创作",
];

const GENERATE_CUES: &[&str] = &["write", "generate", "compose", "draft", "写", "生成", "开始写"];
const GENERATE_TARGETS: &[&str] = &[
    "chapter", "scene", "prologue", "epilogue", "opening", "章", "一段", "开头",
];

const MODIFY_SETTING_CUES: &[&str] = &[
    "change", "make", "rename", "actually", "instead", "no longer", "there's no", "there is no",
    "更", "改", "设定", "其实",
];

const QUERY_CUES: &[&str] = &[
    "what", "who", "where", "how", "show me", "tell me", "describe", "list", "summarize",
    "什么", "谁", "介绍", "查询",
];

const CHARACTER_WORDS: &[&str] = &[
    "character", "protagonist", "hero", "heroine", "villain", "antagonist", "he", "she", "角色",
    "主角", "人物", "反派",
];
const WORLD_WORDS: &[&str] = &[
    "world", "setting", "city", "place", "era", "magic", "technology", "universe", "世界",
    "设定", "时代", "地点",
];
const PLOT_WORDS: &[&str] = &[
    "plot", "conflict", "twist", "ending", "event", "arc", "情节", "剧情", "结局", "冲突",
];
const STYLE_WORDS: &[&str] = &[
    "style", "tone", "voice", "pov", "perspective", "pacing", "tense", "风格", "视角", "语气",
    "节奏",
];

/// The agent asks the gateway only below this rule confidence.
const LLM_FALLBACK_THRESHOLD: f64 = 0.6;

pub struct IntentRecognizer {
    gateway: Option<Arc<LlmGateway>>,
}

impl Default for IntentRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentRecognizer {
    #[must_use]
    pub fn new() -> Self {
        Self { gateway: None }
    }

    #[must_use]
    pub fn with_gateway(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway: Some(gateway),
        }
    }

    /// Classify one turn. Keyword rules run first; the gateway is consulted
    /// only when they are unsure, and its failure falls back to the rule
    /// result rather than erroring the turn.
    pub async fn recognize(&self, text: &str) -> IntentResult {
        let ruled = rule_stage(text);
        if ruled.confidence >= LLM_FALLBACK_THRESHOLD {
            return ruled;
        }

        let Some(gateway) = &self.gateway else {
            return ruled;
        };

        match self.ask_gateway(gateway, text).await {
            Some(intent) => IntentResult {
                intent,
                confidence: 0.75,
                rationale: "classified by model".into(),
            },
            None => ruled,
        }
    }

    async fn ask_gateway(&self, gateway: &LlmGateway, text: &str) -> Option<IntentKind> {
        let labels = IntentKind::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let request = ChatRequest::new(vec![
            ChatMessage::system(format!(
                "Classify the user's message for a fiction-writing assistant. \
                 Reply with exactly one label from: {labels}."
            )),
            ChatMessage::user(text.to_string()),
        ])
        .with_temperature(0.0)
        .with_max_tokens(8);

        match gateway.generate(&request).await {
            Ok(response) => parse_label(&response.content),
            Err(error) => {
                tracing::debug!(error = %error, "intent fallback classification unavailable");
                None
            }
        }
    }
}

fn rule_stage(text: &str) -> IntentResult {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return IntentResult {
            intent: IntentKind::Chat,
            confidence: 0.3,
            rationale: "empty message".into(),
        };
    }
    let lower = trimmed.to_lowercase();
    let contains_any = |cues: &[&str]| cues.iter().any(|cue| lower.contains(cue));

    // Order matters: the sharper signals are checked first.
    if contains_any(MODIFY_CONTENT_CUES) {
        return IntentResult {
            intent: IntentKind::ModifyContent,
            confidence: 0.9,
            rationale: "content revision cue".into(),
        };
    }

    if contains_any(CONTINUE_CUES) {
        let confidence = if trimmed.chars().count() <= 24 { 0.95 } else { 0.8 };
        return IntentResult {
            intent: IntentKind::ContinueContent,
            confidence,
            rationale: "continuation cue".into(),
        };
    }

    if contains_any(CREATE_STORY_SUBJECTS) && contains_any(CREATE_STORY_VERBS) {
        return IntentResult {
            intent: IntentKind::CreateStory,
            confidence: 0.85,
            rationale: "new work cue".into(),
        };
    }

    if contains_any(GENERATE_CUES) && contains_any(GENERATE_TARGETS) {
        return IntentResult {
            intent: IntentKind::GenerateContent,
            confidence: 0.9,
            rationale: "explicit generation cue".into(),
        };
    }

    if contains_any(MODIFY_SETTING_CUES) && !detect_topics(&lower).is_empty() {
        return IntentResult {
            intent: IntentKind::ModifySetting,
            confidence: 0.75,
            rationale: "setting change cue".into(),
        };
    }

    if contains_any(QUERY_CUES) || trimmed.ends_with('?') || trimmed.ends_with('？') {
        return IntentResult {
            intent: IntentKind::Query,
            confidence: 0.65,
            rationale: "question cue".into(),
        };
    }

    IntentResult {
        intent: IntentKind::Chat,
        confidence: 0.3,
        rationale: "no cue matched".into(),
    }
}

/// Setting areas a turn mentions; used to scope extraction and replies.
#[must_use]
pub fn detect_topics(lower: &str) -> Vec<SettingTopic> {
    let mut topics = Vec::new();
    let contains_any = |cues: &[&str]| cues.iter().any(|cue| lower.contains(cue));
    if contains_any(CHARACTER_WORDS) {
        topics.push(SettingTopic::Character);
    }
    if contains_any(WORLD_WORDS) {
        topics.push(SettingTopic::World);
    }
    if contains_any(PLOT_WORDS) {
        topics.push(SettingTopic::Plot);
    }
    if contains_any(STYLE_WORDS) {
        topics.push(SettingTopic::Style);
    }
    topics
}

fn parse_label(reply: &str) -> Option<IntentKind> {
    let normalized = reply.trim().to_lowercase().replace([' ', '-'], "_");
    IntentKind::ALL
        .into_iter()
        .find(|kind| normalized.contains(kind.as_str()))
}
