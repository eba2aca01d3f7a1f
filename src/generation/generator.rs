use super::prompt::{compose, PromptInputs};
use super::record::{count_words, ChapterState, GenerationMode, GenerationRecord};
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::error::GenerationError;
use crate::llm::{ChatMessage, ChatRequest, ChatResponse, LlmGateway, TokenUsage};
use crate::memory::LayeredMemory;
use crate::settings::SettingsBundle;
use std::sync::Arc;

/// Prompt may take at most this share of the context window.
const PROMPT_SHARE: f64 = 0.60;
/// Completion may take at most this share; the rest is slack.
const COMPLETION_SHARE: f64 = 0.35;
/// Chapter summaries fed back into PLOT memory stay under this many words.
const SUMMARY_WORD_CAP: u32 = 200;

/// What the generator was asked to do, independent of where the inputs
/// came from.
#[derive(Debug, Clone)]
pub struct GenerationSpec {
    pub project_id: String,
    pub chapter_number: u32,
    pub mode: GenerationMode,
    pub target_length: Option<u32>,
    pub constraints: Vec<String>,
    pub previous_content: Option<String>,
    /// Record id this one forks from (REWRITE lineage).
    pub parent_id: Option<String>,
}

impl GenerationSpec {
    pub fn new(project_id: impl Into<String>, chapter_number: u32, mode: GenerationMode) -> Self {
        Self {
            project_id: project_id.into(),
            chapter_number,
            mode,
            target_length: None,
            constraints: Vec::new(),
            previous_content: None,
            parent_id: None,
        }
    }

    #[must_use]
    pub fn with_target_length(mut self, words: u32) -> Self {
        self.target_length = Some(words);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    #[must_use]
    pub fn with_previous_content(mut self, content: impl Into<String>) -> Self {
        self.previous_content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A finished generation: the draft record plus everything the agent
/// writes back to memory at commit time.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub record: GenerationRecord,
    pub usage: TokenUsage,
    pub consistency: ConsistencyReport,
    /// Chapter summary destined for PLOT memory (absent for outlines).
    pub plot_summary: Option<String>,
}

/// Produces chapter prose from a settings snapshot and layered memory.
/// Never touches storage; the agent owns persistence.
pub struct ContentGenerator {
    gateway: Arc<LlmGateway>,
    checker: Arc<ConsistencyChecker>,
    max_completion_tokens: u32,
    temperature: f64,
}

impl ContentGenerator {
    pub fn new(gateway: Arc<LlmGateway>, checker: Arc<ConsistencyChecker>) -> Self {
        Self {
            gateway,
            checker,
            max_completion_tokens: 3500,
            temperature: 0.8,
        }
    }

    #[must_use]
    pub fn with_max_completion_tokens(mut self, tokens: u32) -> Self {
        self.max_completion_tokens = tokens.max(64);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Full pipeline: prepare prompt, call the gateway, post-process.
    pub async fn generate(
        &self,
        spec: &GenerationSpec,
        snapshot: &SettingsBundle,
        memory: &LayeredMemory,
    ) -> Result<GenerationOutcome, GenerationError> {
        let request = self.prepare(spec, snapshot, memory).await?;
        let response = self.gateway.generate(&request).await?;
        self.finish(spec, snapshot, response).await
    }

    /// Build the chapter request under the token-budget rule: prompt ≤ 60%
    /// of the window, completion ≤ 35%, 5% slack. An oversized prompt
    /// retries with a tighter memory budget and lower k before giving up.
    pub async fn prepare(
        &self,
        spec: &GenerationSpec,
        snapshot: &SettingsBundle,
        memory: &LayeredMemory,
    ) -> Result<ChatRequest, GenerationError> {
        if spec.mode.needs_previous_content() && spec.previous_content.is_none() {
            return Err(GenerationError::MissingPreviousContent {
                mode: spec.mode.as_str(),
            });
        }

        let window = self.gateway.context_window();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let prompt_budget = (f64::from(window) * PROMPT_SHARE) as u32;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let completion_budget =
            ((f64::from(window) * COMPLETION_SHARE) as u32).min(self.max_completion_tokens);

        let query = retrieval_query(spec, snapshot);
        let target_length = spec.target_length.unwrap_or(1000);

        // Fixed blocks first; what remains funds the memory block.
        let skeleton = compose(
            &PromptInputs {
                mode: spec.mode,
                bundle: snapshot,
                memory_context: "",
                chapter_number: spec.chapter_number,
                target_length,
                constraints: &spec.constraints,
                previous_content: spec.previous_content.as_deref(),
            },
            prompt_budget,
        );
        let fixed_tokens = count_messages(&self.gateway, &skeleton);
        if fixed_tokens > prompt_budget {
            return Err(GenerationError::PromptOverflow {
                tokens: fixed_tokens,
                budget: prompt_budget,
            });
        }

        let mut memory_budget = prompt_budget.saturating_sub(fixed_tokens);
        let mut k = memory.retrieval_k();

        for _ in 0..3 {
            let memory_context = if memory_budget >= 50 {
                memory
                    .build_context_with_k(&query, memory_budget, k)
                    .await
                    .unwrap_or_default()
            } else {
                String::new()
            };

            let messages = compose(
                &PromptInputs {
                    mode: spec.mode,
                    bundle: snapshot,
                    memory_context: &memory_context,
                    chapter_number: spec.chapter_number,
                    target_length,
                    constraints: &spec.constraints,
                    previous_content: spec.previous_content.as_deref(),
                },
                prompt_budget,
            );

            let tokens = count_messages(&self.gateway, &messages);
            if tokens <= prompt_budget {
                return Ok(ChatRequest::new(messages)
                    .with_temperature(self.temperature)
                    .with_max_tokens(completion_budget));
            }

            tracing::debug!(tokens, prompt_budget, "prompt over budget, tightening retrieval");
            memory_budget /= 2;
            k = (k / 2).max(1);
        }

        // Tightening never converged: drop the memory block entirely. The
        // skeleton was already verified to fit.
        Ok(ChatRequest::new(skeleton)
            .with_temperature(self.temperature)
            .with_max_tokens(completion_budget))
    }

    /// Post-generation: word count, consistency check against the
    /// snapshot, and the PLOT summary for memory write-back.
    pub async fn finish(
        &self,
        spec: &GenerationSpec,
        snapshot: &SettingsBundle,
        response: ChatResponse,
    ) -> Result<GenerationOutcome, GenerationError> {
        let content = response.content;
        let word_count = count_words(&content);
        let consistency = self.checker.check_chapter(snapshot, &content, false);

        let plot_summary = if spec.mode == GenerationMode::Outline {
            None
        } else {
            Some(self.summarize_chapter(spec.chapter_number, &content).await)
        };

        let mut record = GenerationRecord::new(
            &spec.project_id,
            spec.chapter_number,
            spec.mode,
            snapshot.fingerprint(),
        );
        record.state = ChapterState::Draft;
        record.content = content;
        record.word_count = word_count;
        record.parent_id.clone_from(&spec.parent_id);

        Ok(GenerationOutcome {
            record,
            usage: response.usage,
            consistency,
            plot_summary,
        })
    }

    /// Chapter summary for PLOT memory, via the gateway with a local
    /// fallback when the call fails.
    async fn summarize_chapter(&self, chapter_number: u32, content: &str) -> String {
        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "You summarize novel chapters for a story bible. Under 200 \
                 words: events, reveals, open threads. No commentary.",
            ),
            ChatMessage::user(content.to_string()),
        ])
        .with_temperature(0.2)
        .with_max_tokens(400);

        match self.gateway.generate(&request).await {
            Ok(response) if !response.content.trim().is_empty() => {
                let summary = clamp_words(response.content.trim(), SUMMARY_WORD_CAP);
                format!("Chapter {chapter_number}: {summary}")
            }
            Ok(_) | Err(_) => {
                tracing::warn!(chapter_number, "chapter summary fell back to excerpt");
                format!(
                    "Chapter {chapter_number}: {}",
                    clamp_words(content, SUMMARY_WORD_CAP)
                )
            }
        }
    }
}

fn retrieval_query(spec: &GenerationSpec, snapshot: &SettingsBundle) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(protagonist) = snapshot.protagonist() {
        parts.push(protagonist.name.clone());
    }
    for point in snapshot.plot_points.iter().rev().take(2) {
        parts.push(point.summary.clone());
    }
    parts.push(format!("chapter {}", spec.chapter_number));
    parts.join(" ")
}

fn count_messages(gateway: &LlmGateway, messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| gateway.count_tokens(&m.content))
        .sum()
}

fn clamp_words(text: &str, cap: u32) -> String {
    let mut taken = Vec::new();
    for word in text.split_whitespace() {
        if taken.len() as u32 >= cap {
            break;
        }
        taken.push(word);
    }
    taken.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConsistencyWeights};
    use crate::llm::MockProvider;
    use crate::memory::{InMemoryVectorIndex, LayeredMemory, NoopEmbedding};
    use crate::settings::{CharacterProfile, CharacterRole, PlotPoint, PlotPointKind};
    use crate::storage::InMemoryStore;

    fn snapshot() -> SettingsBundle {
        let mut bundle = SettingsBundle {
            characters: vec![CharacterProfile::new("Lin Feng", CharacterRole::Protagonist)
                .with_trait("ex-detective")],
            plot_points: vec![
                PlotPoint::new(PlotPointKind::Inciting, "an AI goes missing").involving("Lin Feng"),
            ],
            ..SettingsBundle::default()
        };
        bundle.world.genre = Some("cyberpunk".into());
        bundle.world.add_location("Shanghai");
        bundle
    }

    fn memory() -> LayeredMemory {
        LayeredMemory::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(NoopEmbedding),
            "p1",
        )
    }

    fn generator_with(provider: Arc<MockProvider>) -> ContentGenerator {
        let gateway = Arc::new(LlmGateway::new(provider, &Config::default()));
        let checker = Arc::new(ConsistencyChecker::new(ConsistencyWeights::default()));
        ContentGenerator::new(gateway, checker)
    }

    #[tokio::test]
    async fn full_generation_produces_draft_with_summary() {
        let provider = Arc::new(
            MockProvider::new()
                .with_reply("Lin Feng lit a cigarette in the rain. The case file glowed.")
                .with_reply("Lin Feng takes the missing AI case."),
        );
        let generator = generator_with(provider.clone());
        let spec = GenerationSpec::new("p1", 1, GenerationMode::Full).with_target_length(800);

        let outcome = generator
            .generate(&spec, &snapshot(), &memory())
            .await
            .unwrap();

        assert_eq!(outcome.record.state, ChapterState::Draft);
        assert!(outcome.record.word_count > 0);
        assert_eq!(outcome.record.settings_fingerprint, snapshot().fingerprint());
        let summary = outcome.plot_summary.unwrap();
        assert!(summary.starts_with("Chapter 1:"));
        assert!(summary.contains("missing AI"));
        // One call for the chapter, one for the summary.
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn continue_without_previous_content_is_rejected() {
        let generator = generator_with(Arc::new(MockProvider::new()));
        let spec = GenerationSpec::new("p1", 2, GenerationMode::Continue);
        let error = generator
            .prepare(&spec, &snapshot(), &memory())
            .await
            .unwrap_err();
        assert!(matches!(error, GenerationError::MissingPreviousContent { .. }));
    }

    #[tokio::test]
    async fn continuation_seed_reaches_prompt() {
        let provider = Arc::new(MockProvider::new());
        let generator = generator_with(provider);
        let spec = GenerationSpec::new("p1", 2, GenerationMode::Continue)
            .with_previous_content("The last line of chapter one.");
        let request = generator
            .prepare(&spec, &snapshot(), &memory())
            .await
            .unwrap();
        assert!(request.messages[1]
            .content
            .contains("The last line of chapter one."));
    }

    #[tokio::test]
    async fn prompt_overflow_after_tightening() {
        let provider = Arc::new(MockProvider::new().with_context_window(64));
        let generator = generator_with(provider);
        // A huge fixed seed blows the 60% budget no matter the memory.
        let spec = GenerationSpec::new("p1", 2, GenerationMode::Continue)
            .with_previous_content("word ".repeat(4000));
        let error = generator
            .prepare(&spec, &snapshot(), &memory())
            .await
            .unwrap_err();
        assert!(matches!(error, GenerationError::PromptOverflow { .. }));
    }

    #[tokio::test]
    async fn completion_cap_honors_config_and_window() {
        let provider = Arc::new(MockProvider::new());
        let gateway = Arc::new(LlmGateway::new(provider, &Config::default()));
        let checker = Arc::new(ConsistencyChecker::new(ConsistencyWeights::default()));
        let generator =
            ContentGenerator::new(gateway, checker).with_max_completion_tokens(1200);

        let spec = GenerationSpec::new("p1", 1, GenerationMode::Full);
        let request = generator
            .prepare(&spec, &snapshot(), &memory())
            .await
            .unwrap();
        assert_eq!(request.max_tokens, 1200);
    }

    #[tokio::test]
    async fn outline_mode_skips_plot_summary() {
        let provider = Arc::new(MockProvider::new().with_reply("1. The case\n2. The chase"));
        let generator = generator_with(provider.clone());
        let spec = GenerationSpec::new("p1", 1, GenerationMode::Outline);

        let outcome = generator
            .generate(&spec, &snapshot(), &memory())
            .await
            .unwrap();
        assert!(outcome.plot_summary.is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn summary_falls_back_to_excerpt_on_gateway_failure() {
        // Chapter reply is scripted; the summary call gets the empty
        // default reply, which triggers the excerpt fallback.
        let provider = Arc::new(
            MockProvider::new()
                .with_reply("The chase through the wet market lasted three pages.")
                .with_default_reply(""),
        );
        let generator = generator_with(provider);
        let spec = GenerationSpec::new("p1", 3, GenerationMode::Full);

        let outcome = generator
            .generate(&spec, &snapshot(), &memory())
            .await
            .unwrap();
        let summary = outcome.plot_summary.unwrap();
        assert!(summary.contains("wet market"));
    }

    #[tokio::test]
    async fn rewrite_links_parent() {
        let provider = Arc::new(
            MockProvider::new()
                .with_reply("New ending, sharper.")
                .with_reply("Chapter rewritten."),
        );
        let generator = generator_with(provider);
        let spec = GenerationSpec::new("p1", 4, GenerationMode::Rewrite)
            .with_previous_content("old chapter text")
            .with_parent("gen_parent");

        let outcome = generator
            .generate(&spec, &snapshot(), &memory())
            .await
            .unwrap();
        assert_eq!(outcome.record.parent_id.as_deref(), Some("gen_parent"));
        assert_eq!(outcome.record.chapter_number, 4);
    }
}
