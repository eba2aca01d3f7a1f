// The turn coordinator: classify → extract → decide → generate → commit.
// All memory writes ride a single end-of-turn commit; per-session turns
// serialize behind keyed locks; per-chapter generations coalesce.

pub mod decision;
pub mod reply;

pub use decision::{decide, CreationDecision, CreationTrigger, DecisionInputs};
pub use reply::{ChatEvent, ChatEventStream, ChatReply, ErrorEnvelope, GeneratedPayload};

use crate::config::Config;
use crate::consistency::ConsistencyChecker;
use crate::error::{FabulaError, GenerationError, Result};
use crate::generation::{
    await_flight, ContentGenerator, Flight, GenerationMode, GenerationOutcome, GenerationRecord,
    GenerationSpec, InFlightGenerations, SharedFailure,
};
use crate::intent::{IntentKind, IntentRecognizer, IntentResult};
use crate::llm::{CancelToken, LlmGateway, StreamCollector, StreamEvent};
use crate::memory::{
    EmbeddingProvider, LayeredMemory, MemoryItem, MemoryLevel, MemoryPatch, MetadataValue,
    VectorStore,
};
use crate::session::{Session, SessionCache, Turn};
use crate::settings::{AiCompleter, SettingPipeline, SettingsBundle};
use crate::storage::{MemoryRepository, Store, TurnWrites};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Explicit dependency bundle threaded through the agent at construction.
/// Created at init, released on shutdown; nothing ambient.
pub struct AgentContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub gateway: Arc<LlmGateway>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl AgentContext {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        gateway: Arc<LlmGateway>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            gateway,
            vectors,
            embedder,
        }
    }
}

/// The conversational authoring agent (library surface of the engine).
pub struct ConversationalAgent {
    config: Config,
    store: Arc<dyn Store>,
    gateway: Arc<LlmGateway>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    sessions: SessionCache,
    recognizer: IntentRecognizer,
    pipeline: SettingPipeline,
    completer: AiCompleter,
    checker: Arc<ConsistencyChecker>,
    generator: ContentGenerator,
    inflight: InFlightGenerations,
}

impl ConversationalAgent {
    pub fn new(ctx: AgentContext) -> Self {
        let AgentContext {
            config,
            store,
            gateway,
            vectors,
            embedder,
        } = ctx;

        let checker = Arc::new(
            ConsistencyChecker::new(config.consistency).with_gateway(Arc::clone(&gateway)),
        );
        let generator = ContentGenerator::new(Arc::clone(&gateway), Arc::clone(&checker))
            .with_max_completion_tokens(config.generation_max_tokens)
            .with_temperature(config.temperature);

        Self {
            recognizer: IntentRecognizer::with_gateway(Arc::clone(&gateway)),
            pipeline: SettingPipeline::new(config.completion_threshold),
            completer: AiCompleter::new(Arc::clone(&gateway)),
            sessions: SessionCache::new(256),
            inflight: InFlightGenerations::new(),
            checker,
            generator,
            config,
            store,
            gateway,
            vectors,
            embedder,
        }
    }

    // ── Agent API ───────────────────────────────────────────────

    /// One conversational turn. Always returns a reply payload; failures
    /// carry a neutral text plus an error envelope.
    pub async fn chat(
        &self,
        session_id: Option<&str>,
        message: &str,
        project_id: Option<&str>,
    ) -> ChatReply {
        self.chat_with_cancel(session_id, message, project_id, &CancelToken::new())
            .await
    }

    pub async fn chat_with_cancel(
        &self,
        session_id: Option<&str>,
        message: &str,
        project_id: Option<&str>,
        cancel: &CancelToken,
    ) -> ChatReply {
        self.chat_inner(session_id, message, project_id, cancel, None)
            .await
    }

    /// Streaming variant: lazy `token / artifact / consistency / done /
    /// error` events. The final `done` (or `error`) always arrives.
    pub fn chat_stream(
        self: &Arc<Self>,
        session_id: Option<String>,
        message: String,
        project_id: Option<String>,
        cancel: CancelToken,
    ) -> ChatEventStream {
        let agent = Arc::clone(self);
        let (tx, rx) = mpsc::channel::<ChatEvent>(32);

        tokio::spawn(async move {
            let reply = agent
                .chat_inner(
                    session_id.as_deref(),
                    &message,
                    project_id.as_deref(),
                    &cancel,
                    Some(tx.clone()),
                )
                .await;

            if let Some(report) = &reply.consistency {
                let _ = tx.send(ChatEvent::Consistency(report.clone())).await;
            }
            if let Some(generated) = &reply.generated {
                let _ = tx.send(ChatEvent::Artifact(generated.clone())).await;
            }
            match &reply.error {
                Some(envelope) => {
                    let _ = tx.send(ChatEvent::Error(*envelope)).await;
                }
                None => {
                    let _ = tx.send(ChatEvent::Done(reply)).await;
                }
            }
        });

        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    /// Direct chapter generation for a project, outside any session.
    /// Concurrent calls for the same `(project, chapter)` coalesce onto one
    /// record; the joined caller sees `coalesced = true`.
    pub async fn generate_chapter(
        &self,
        project_id: &str,
        chapter_number: u32,
        mode: GenerationMode,
        constraints: Vec<String>,
    ) -> Result<(GenerationRecord, bool)> {
        match self.inflight.begin(project_id, chapter_number) {
            Flight::Lead(guard) => {
                let result = self
                    .lead_generation(project_id, chapter_number, mode, constraints)
                    .await;
                match result {
                    Ok((record, _)) => {
                        guard.publish(Ok(record.clone()));
                        Ok((record, false))
                    }
                    Err(error) => {
                        guard.publish(Err(SharedFailure {
                            kind: error.kind(),
                            message: error.to_string(),
                        }));
                        Err(error)
                    }
                }
            }
            Flight::Join(receiver) => match await_flight(receiver).await {
                Ok(record) => Ok((record, true)),
                Err(failure) => Err(FabulaError::Other(anyhow::anyhow!(
                    "coalesced generation failed: {} ({:?})",
                    failure.message,
                    failure.kind
                ))),
            },
        }
    }

    /// All generation records of a project, chapter order.
    pub async fn list_generations(&self, project_id: &str) -> Result<Vec<GenerationRecord>> {
        Ok(self.store.list_records(project_id).await?)
    }

    /// Delete a session (independent of any project).
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.remove(session_id);
        Ok(self.store.evict_session(session_id).await?)
    }

    // ── Turn pipeline ───────────────────────────────────────────

    async fn chat_inner(
        &self,
        session_id: Option<&str>,
        message: &str,
        project_id: Option<&str>,
        cancel: &CancelToken,
        token_sink: Option<mpsc::Sender<ChatEvent>>,
    ) -> ChatReply {
        let session = match self.load_or_create_session(session_id, project_id).await {
            Ok(session) => session,
            Err(error) => {
                return ChatReply::failure(session_id.unwrap_or("unknown"), &error);
            }
        };
        let sid = session.session_id.clone();

        // Per-session serialization: a new turn waits for the prior turn's
        // full pipeline, memory writes included.
        let lock = self.sessions.lock_for(&sid);
        let _guard = lock.lock().await;

        // The lock may have been held while another turn rewrote the
        // session; reread the committed state.
        let session = match self.sessions.get(&sid) {
            Some(cached) => cached,
            None => match self.store.load_session(&sid).await {
                Ok(Some(stored)) => stored,
                _ => session,
            },
        };

        let turn = self.run_turn(session, message, cancel, token_sink);
        match tokio::time::timeout(self.config.timeouts.turn(), turn).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                if matches!(error, FabulaError::Cancelled) {
                    tracing::debug!(session_id = sid.as_str(), "turn cancelled");
                } else {
                    tracing::warn!(session_id = sid.as_str(), error = %error, "turn failed");
                }
                ChatReply::failure(sid, &error)
            }
            Err(_) => {
                let error = FabulaError::Llm(crate::error::LlmError::Timeout {
                    provider: self.gateway.provider_name().to_string(),
                    elapsed_ms: self.config.timeouts.turn().as_millis() as u64,
                });
                tracing::warn!(session_id = sid.as_str(), "turn wall clock exceeded");
                ChatReply::failure(sid, &error)
            }
        }
    }

    async fn run_turn(
        &self,
        session: Session,
        message: &str,
        cancel: &CancelToken,
        token_sink: Option<mpsc::Sender<ChatEvent>>,
    ) -> Result<ChatReply> {
        if cancel.is_cancelled() {
            return Err(FabulaError::Cancelled);
        }

        // Turn-local state only until the final commit.
        let mut working = session;
        working.push_turn(Turn::user(message));
        let mut writes = TurnWrites::new();

        // Step 2: intent.
        let intent = self.recognizer.recognize(message).await;

        // New-work intent with no project binds one.
        if working.project_id.is_none() && intent.intent == IntentKind::CreateStory {
            let title = derive_title(message);
            let project = self.store.create_project(&title).await?;
            tracing::info!(
                project_id = project.id.as_str(),
                title = title.as_str(),
                "project created"
            );
            working.project_id = Some(project.id);
        }
        let project_id = working.project_id.clone();

        // Authoritative bundle: project-level when bound, else the
        // session's derived snapshot.
        let previous_bundle = match &project_id {
            Some(project) => self.store.load_settings(project).await?,
            None => working.derived_settings.clone(),
        };

        // Step 3: settings pipeline for setting-bearing intents.
        let mut bundle = previous_bundle.clone();
        let mut update_notes: Vec<String> = Vec::new();
        let mut consistency_report = None;
        let mut completeness = crate::settings::check_completeness(&bundle);

        if intent.intent.updates_settings() {
            let update = self
                .pipeline
                .run(&previous_bundle, message, &self.completer, &self.checker)
                .await;
            bundle = update.bundle;
            completeness = update.completeness;
            update_notes = update.notes;

            if update.consistency.has_errors() {
                // Conflict: clarify, do not generate. The user's statement
                // stays in history; the note lands in memory.
                let reply_text = clarification_text(&update.consistency);
                working.push_turn(Turn::assistant(reply_text.clone()));
                self.stage_turn_writes(&mut writes, &mut working, &bundle, &project_id, None)
                    .await?;
                if let Some(project) = &project_id {
                    for note in &update_notes {
                        writes.memory_adds.push((
                            project.clone(),
                            MemoryItem::new(MemoryLevel::Context, note.clone())
                                .with_metadata("kind", "conflict_note")
                                .with_metadata(
                                    crate::memory::item::META_ORDER,
                                    working.turns.len() as i64,
                                ),
                        ));
                    }
                }
                let report = update.consistency.clone();
                return self
                    .commit_and_reply(writes, working, reply_text, intent, None, Some(report))
                    .await;
            }
            consistency_report = Some(update.consistency);
        }

        if cancel.is_cancelled() {
            return Err(FabulaError::Cancelled);
        }

        // Step 4: creation decision.
        let consistency_score = consistency_report.as_ref().map_or(1.0, |r| r.score);
        let (current_chapters, last_chapter) = match &project_id {
            Some(project) => self.chapter_state(project).await?,
            None => (Vec::new(), None),
        };
        let decision = decide(&DecisionInputs {
            intent: intent.intent,
            message,
            completeness: completeness.score,
            consistency: consistency_score,
            completion_threshold: self.config.completion_threshold,
            consistency_threshold: self.config.consistency_threshold,
            last_chapter,
            current_chapters: &current_chapters,
        });
        tracing::debug!(
            should_create = decision.should_create,
            mode = decision.mode.as_str(),
            chapter = decision.chapter_number,
            reason = decision.reason.as_str(),
            "creation decision"
        );

        // Step 5: generate, or reply conversationally.
        if decision.should_create {
            if let Some(project) = project_id.clone() {
                return self
                    .generation_turn(
                        writes, working, intent, bundle, project, decision, cancel, token_sink,
                    )
                    .await;
            }
        }

        let reply_text =
            conversational_text(&intent, &bundle, &completeness, &decision, &update_notes);
        if let Some(sink) = &token_sink {
            let _ = sink.send(ChatEvent::Token(reply_text.clone())).await;
        }
        working.push_turn(Turn::assistant(reply_text.clone()));
        self.stage_turn_writes(&mut writes, &mut working, &bundle, &project_id, None)
            .await?;
        self.commit_and_reply(writes, working, reply_text, intent, None, consistency_report)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn generation_turn(
        &self,
        mut writes: TurnWrites,
        mut working: Session,
        intent: IntentResult,
        bundle: SettingsBundle,
        project: String,
        decision: CreationDecision,
        cancel: &CancelToken,
        token_sink: Option<mpsc::Sender<ChatEvent>>,
    ) -> Result<ChatReply> {
        let chapter = decision.chapter_number;

        match self.inflight.begin(&project, chapter) {
            Flight::Lead(guard) => {
                let constraints = constraint_from_message(&intent, &working);
                let result = self
                    .lead_generation_in_turn(
                        &mut writes,
                        &mut working,
                        &bundle,
                        &project,
                        chapter,
                        decision.mode,
                        constraints,
                        cancel,
                        token_sink.as_ref(),
                    )
                    .await;

                match result {
                    Ok((payload, report)) => {
                        let reply_text = generated_text(&payload, &report);
                        working.push_turn(Turn::assistant(reply_text.clone()));
                        writes.session = Some(working.clone());
                        let record_for_waiters = payload.record_id.clone();
                        let reply = self
                            .commit_and_reply(
                                writes,
                                working,
                                reply_text,
                                intent,
                                Some(payload),
                                Some(report),
                            )
                            .await;
                        match &reply {
                            Ok(_) => {
                                // Publish only after the commit so joined
                                // callers observe committed state.
                                if let Ok(Some(record)) =
                                    self.store.get_record(&record_for_waiters).await
                                {
                                    guard.publish(Ok(record));
                                }
                            }
                            Err(error) => {
                                guard.publish(Err(SharedFailure {
                                    kind: error.kind(),
                                    message: error.to_string(),
                                }));
                            }
                        }
                        reply
                    }
                    Err(error) => {
                        guard.publish(Err(SharedFailure {
                            kind: error.kind(),
                            message: error.to_string(),
                        }));
                        Err(error)
                    }
                }
            }
            Flight::Join(receiver) => {
                let record = await_flight(receiver).await.map_err(|failure| {
                    FabulaError::Other(anyhow::anyhow!(
                        "coalesced generation failed: {}",
                        failure.message
                    ))
                })?;
                let payload = GeneratedPayload {
                    record_id: record.id.clone(),
                    chapter_number: record.chapter_number,
                    content: record.content.clone(),
                    word_count: record.word_count,
                    coalesced: true,
                };
                let reply_text = format!(
                    "Chapter {} was just finished ({} words).",
                    record.chapter_number, record.word_count
                );
                working.push_turn(Turn::assistant(reply_text.clone()));
                self.stage_turn_writes(
                    &mut writes,
                    &mut working,
                    &bundle,
                    &Some(project.clone()),
                    None,
                )
                .await?;
                self.commit_and_reply(writes, working, reply_text, intent, Some(payload), None)
                    .await
            }
        }
    }

    /// Generation inside a chat turn: produce the draft, stage its record,
    /// promotion, PLOT summary and chapter CONTEXT into the turn commit.
    #[allow(clippy::too_many_arguments)]
    async fn lead_generation_in_turn(
        &self,
        writes: &mut TurnWrites,
        working: &mut Session,
        bundle: &SettingsBundle,
        project: &str,
        chapter: u32,
        mode: GenerationMode,
        constraints: Vec<String>,
        cancel: &CancelToken,
        token_sink: Option<&mpsc::Sender<ChatEvent>>,
    ) -> Result<(GeneratedPayload, crate::consistency::ConsistencyReport)> {
        let snapshot = bundle.clone();
        let memory = self.memory_for(project);
        let spec = self
            .build_spec(project, chapter, mode, constraints)
            .await?;

        if cancel.is_cancelled() {
            return Err(FabulaError::Cancelled);
        }

        let outcome = match token_sink {
            Some(sink) => {
                // Stream tokens out while collecting the full response.
                let request = self
                    .generator
                    .prepare(&spec, &snapshot, &memory)
                    .await
                    .map_err(FabulaError::Generation)?;
                let mut stream = self
                    .gateway
                    .generate_stream(&request, cancel.clone())
                    .await
                    .map_err(|e| FabulaError::Generation(GenerationError::Llm(e)))?;
                let mut collector = StreamCollector::new();
                while let Some(event) = stream.next().await {
                    let event =
                        event.map_err(|e| FabulaError::Generation(GenerationError::Llm(e)))?;
                    if let StreamEvent::Delta { text } = &event {
                        let _ = sink.send(ChatEvent::Token(text.clone())).await;
                    }
                    collector.feed(&event);
                }
                if cancel.is_cancelled() {
                    return Err(FabulaError::Cancelled);
                }
                self.generator
                    .finish(&spec, &snapshot, collector.finish())
                    .await
                    .map_err(FabulaError::Generation)?
            }
            None => self
                .generator
                .generate(&spec, &snapshot, &memory)
                .await
                .map_err(FabulaError::Generation)?,
        };

        let GenerationOutcome {
            record,
            usage,
            consistency,
            plot_summary,
        } = outcome;
        tracing::info!(
            project,
            chapter,
            mode = mode.as_str(),
            words = record.word_count,
            tokens = usage.total,
            score = consistency.score,
            "chapter generated"
        );

        self.stage_turn_writes(writes, working, bundle, &Some(project.to_string()), None)
            .await?;
        self.stage_generation(writes, project, &record, plot_summary, working.turns.len())
            .await;

        let payload = GeneratedPayload {
            record_id: record.id.clone(),
            chapter_number: record.chapter_number,
            content: record.content.clone(),
            word_count: record.word_count,
            coalesced: false,
        };
        Ok((payload, consistency))
    }

    /// Session-less generation used by `generate_chapter`.
    async fn lead_generation(
        &self,
        project: &str,
        chapter: u32,
        mode: GenerationMode,
        constraints: Vec<String>,
    ) -> Result<(GenerationRecord, bool)> {
        let snapshot = self.store.load_settings(project).await?;
        let memory = self.memory_for(project);
        let spec = self.build_spec(project, chapter, mode, constraints).await?;

        let outcome = self
            .generator
            .generate(&spec, &snapshot, &memory)
            .await
            .map_err(FabulaError::Generation)?;

        let mut writes = TurnWrites::new();
        self.stage_generation(&mut writes, project, &outcome.record, outcome.plot_summary, 0)
            .await;
        self.store.commit_turn(writes).await?;

        let record = self
            .store
            .get_record(&outcome.record.id)
            .await?
            .unwrap_or(outcome.record);
        Ok((record, false))
    }

    /// Resolve previous content and lineage for the chosen mode.
    async fn build_spec(
        &self,
        project: &str,
        chapter: u32,
        mode: GenerationMode,
        constraints: Vec<String>,
    ) -> Result<GenerationSpec> {
        let mut spec = GenerationSpec::new(project, chapter, mode);
        spec.constraints = constraints;
        spec.target_length = Some(1000);

        match mode {
            GenerationMode::Continue => {
                let previous = match chapter.checked_sub(1) {
                    Some(prev) if prev >= 1 => self.store.get_current(project, prev).await?,
                    _ => None,
                };
                match previous {
                    Some(record) => spec.previous_content = Some(record.content),
                    // Nothing to continue from: degrade to a fresh chapter.
                    None => spec.mode = GenerationMode::Full,
                }
            }
            GenerationMode::Rewrite | GenerationMode::Expand => {
                let current = self.store.get_current(project, chapter).await?.ok_or(
                    FabulaError::Generation(GenerationError::NoCurrentRecord { chapter }),
                )?;
                spec.previous_content = Some(current.content.clone());
                spec.parent_id = Some(current.id);
            }
            GenerationMode::Full | GenerationMode::Outline => {}
        }
        Ok(spec)
    }

    // ── Staging & commit ────────────────────────────────────────

    /// Stage the non-generation writes of a turn: session state, settings
    /// snapshot, the dialogue CONTEXT item (with ring eviction), setting
    /// mirrors, and the eviction summary when the turn cap is exceeded.
    async fn stage_turn_writes(
        &self,
        writes: &mut TurnWrites,
        working: &mut Session,
        bundle: &SettingsBundle,
        project_id: &Option<String>,
        dialogue_override: Option<String>,
    ) -> Result<()> {
        // Turn cap: summarize-and-evict the overflow before persisting.
        let over = working.over_cap(self.config.session_turn_cap);
        if over > 0 {
            let evicted = working.evict_oldest(over);
            let folded = fold_turns(&evicted);
            working.summary = Some(match working.summary.take() {
                Some(existing) => format!("{existing}\n{folded}"),
                None => folded,
            });
            if let Some(project) = project_id {
                self.stage_summary_item(writes, project, working).await?;
            }
        }

        working.derived_settings = bundle.clone();
        writes.session = Some(working.clone());

        let Some(project) = project_id else {
            return Ok(());
        };

        writes.settings = Some((project.clone(), bundle.clone()));

        // Dialogue context item for this turn.
        let dialogue = dialogue_override.unwrap_or_else(|| {
            working
                .recent_turns(2)
                .iter()
                .map(|turn| {
                    let role = match turn.role {
                        crate::session::TurnRole::User => "User",
                        crate::session::TurnRole::Assistant => "Assistant",
                    };
                    format!("{role}: {}", turn.text)
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
        let order = working.turns.len() as i64;
        let item = self
            .embedded_item(MemoryLevel::Context, dialogue)
            .await
            .with_metadata(crate::memory::item::META_ORDER, order);
        writes.memory_adds.push((project.clone(), item));
        self.stage_context_eviction(writes, project).await?;

        self.stage_setting_mirrors(writes, project, bundle).await?;
        Ok(())
    }

    /// Keep the CONTEXT ring bounded across the staged adds.
    async fn stage_context_eviction(&self, writes: &mut TurnWrites, project: &str) -> Result<()> {
        let cap = self.config.memory.context_items_cap;
        let mut existing = self
            .store
            .list_items(project, Some(MemoryLevel::Context), None)
            .await?;
        let staged = writes
            .memory_adds
            .iter()
            .filter(|(p, item)| p == project && item.level == MemoryLevel::Context)
            .count();
        let total = existing.len() + staged;
        if total <= cap {
            return Ok(());
        }

        existing.sort_by_key(|item| item.order().unwrap_or(i64::MIN));
        for item in existing.into_iter().take(total - cap) {
            writes
                .memory_deletes
                .push((project.to_string(), item.id));
        }
        Ok(())
    }

    /// Mirror the bundle into GLOBAL / CHARACTER / STYLE memory so
    /// retrieval sees the same facts generation reads from the snapshot.
    async fn stage_setting_mirrors(
        &self,
        writes: &mut TurnWrites,
        project: &str,
        bundle: &SettingsBundle,
    ) -> Result<()> {
        // World overview: one GLOBAL item.
        let world_text = world_overview(bundle);
        if !world_text.is_empty() {
            let existing = self
                .store
                .list_items(project, Some(MemoryLevel::Global), None)
                .await?
                .into_iter()
                .find(|item| {
                    item.metadata.get("kind").and_then(MetadataValue::as_str) == Some("world")
                });
            match existing {
                Some(item) if item.content != world_text => {
                    writes.memory_updates.push((
                        project.to_string(),
                        item.id,
                        self.embedded_patch(world_text).await,
                    ));
                }
                Some(_) => {}
                None => {
                    let item = self
                        .embedded_item(MemoryLevel::Global, world_text)
                        .await
                        .with_metadata("kind", "world");
                    writes.memory_adds.push((project.to_string(), item));
                }
            }
        }

        // One CHARACTER item per profile.
        let existing_characters = self
            .store
            .list_items(project, Some(MemoryLevel::Character), None)
            .await?;
        for character in &bundle.characters {
            let text = character_sheet(character);
            let existing = existing_characters
                .iter()
                .find(|item| item.character_name() == Some(character.name.as_str()));
            match existing {
                Some(item) if item.content != text => {
                    writes.memory_updates.push((
                        project.to_string(),
                        item.id.clone(),
                        self.embedded_patch(text).await,
                    ));
                }
                Some(_) => {}
                None => {
                    let item = self
                        .embedded_item(MemoryLevel::Character, text)
                        .await
                        .with_metadata(
                            crate::memory::item::META_CHARACTER,
                            character.name.as_str(),
                        );
                    writes.memory_adds.push((project.to_string(), item));
                }
            }
        }

        // STYLE singletons per aspect.
        let existing_styles = self
            .store
            .list_items(project, Some(MemoryLevel::Style), None)
            .await?;
        for (aspect, value) in &bundle.style_hints {
            let existing = existing_styles
                .iter()
                .find(|item| item.aspect() == Some(aspect.as_str()));
            match existing {
                Some(item) if item.content != *value => {
                    writes.memory_updates.push((
                        project.to_string(),
                        item.id.clone(),
                        self.embedded_patch(value.clone()).await,
                    ));
                }
                Some(_) => {}
                None => {
                    let item = self
                        .embedded_item(MemoryLevel::Style, value.clone())
                        .await
                        .with_metadata(crate::memory::item::META_ASPECT, aspect.as_str());
                    writes.memory_adds.push((project.to_string(), item));
                }
            }
        }
        Ok(())
    }

    async fn stage_summary_item(
        &self,
        writes: &mut TurnWrites,
        project: &str,
        working: &Session,
    ) -> Result<()> {
        let Some(summary) = &working.summary else {
            return Ok(());
        };
        let text = format!("Earlier conversation:\n{summary}");
        let existing = self
            .store
            .list_items(project, Some(MemoryLevel::Context), None)
            .await?
            .into_iter()
            .find(|item| {
                item.metadata.get("kind").and_then(MetadataValue::as_str)
                    == Some("session_summary")
            });
        match existing {
            Some(item) => {
                let patch = self
                    .embedded_patch(text)
                    .await
                    .with_metadata(
                        crate::memory::item::META_ORDER,
                        working.turns.len() as i64,
                    );
                writes
                    .memory_updates
                    .push((project.to_string(), item.id, patch));
            }
            None => {
                let item = self
                    .embedded_item(MemoryLevel::Context, text)
                    .await
                    .with_metadata("kind", "session_summary")
                    .with_metadata(
                        crate::memory::item::META_ORDER,
                        working.turns.len() as i64,
                    );
                writes.memory_adds.push((project.to_string(), item));
            }
        }
        Ok(())
    }

    /// Stage the generated record: draft row, promotion to CURRENT, PLOT
    /// summary, and the chapter text into the CONTEXT ring.
    async fn stage_generation(
        &self,
        writes: &mut TurnWrites,
        project: &str,
        record: &GenerationRecord,
        plot_summary: Option<String>,
        turn_order: usize,
    ) {
        writes.records.push(record.clone());
        writes.promote_current.push((
            project.to_string(),
            record.chapter_number,
            record.id.clone(),
        ));

        if let Some(summary) = plot_summary {
            let item = self
                .embedded_item(MemoryLevel::Plot, summary)
                .await
                .with_metadata(
                    crate::memory::item::META_CHAPTER,
                    i64::from(record.chapter_number),
                );
            writes.memory_adds.push((project.to_string(), item));
        }

        if record.mode != GenerationMode::Outline {
            let item = self
                .embedded_item(MemoryLevel::Context, record.content.clone())
                .await
                .with_metadata(crate::memory::item::META_ORDER, turn_order as i64 + 1)
                .with_metadata(
                    crate::memory::item::META_CHAPTER,
                    i64::from(record.chapter_number),
                );
            writes.memory_adds.push((project.to_string(), item));
        }
    }

    async fn commit_and_reply(
        &self,
        mut writes: TurnWrites,
        working: Session,
        text: String,
        intent: IntentResult,
        generated: Option<GeneratedPayload>,
        consistency: Option<crate::consistency::ConsistencyReport>,
    ) -> Result<ChatReply> {
        if writes.session.is_none() {
            writes.session = Some(working.clone());
        }

        // The single end-of-turn commit: before this point everything was
        // turn-local, so failures leave pre-turn state.
        let mirror: Vec<(String, MemoryItem)> = writes.memory_adds.clone();
        self.store.commit_turn(writes).await?;

        // Best-effort vector mirror after the durable write.
        for (_, item) in mirror {
            if let Some(embedding) = item.embedding {
                let _ = self.vectors.upsert(&item.id, embedding, item.level).await;
            }
        }

        let session_id = working.session_id.clone();
        self.sessions.put(working);

        Ok(ChatReply {
            session_id,
            text,
            intent: intent.intent,
            generated,
            consistency,
            error: None,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────

    async fn load_or_create_session(
        &self,
        session_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Session> {
        if let Some(id) = session_id {
            if let Some(session) = self.sessions.get(id) {
                return Ok(session);
            }
            if let Some(session) = self.store.load_session(id).await? {
                self.sessions.put(session.clone());
                return Ok(session);
            }
            // Unknown id: honor it so reconnecting callers keep a stable
            // handle.
            let mut session = Session::new(project_id.map(str::to_string));
            session.session_id = id.to_string();
            return Ok(session);
        }
        Ok(Session::new(project_id.map(str::to_string)))
    }

    fn memory_for(&self, project_id: &str) -> LayeredMemory {
        let repo: Arc<dyn MemoryRepository> = self.store.clone();
        LayeredMemory::new(
            repo,
            Arc::clone(&self.vectors),
            Arc::clone(&self.embedder),
            project_id,
        )
        .with_context_cap(self.config.memory.context_items_cap)
        .with_retrieval_k(self.config.retrieval_k)
        .with_vector_timeout(self.config.timeouts.vector())
    }

    async fn chapter_state(&self, project: &str) -> Result<(Vec<u32>, Option<u32>)> {
        let records = self.store.list_records(project).await?;
        let currents: Vec<u32> = records
            .iter()
            .filter(|record| record.state == crate::generation::ChapterState::Current)
            .map(|record| record.chapter_number)
            .collect();
        let last = records.iter().map(|record| record.chapter_number).max();
        Ok((currents, last))
    }

    async fn embedded_item(&self, level: MemoryLevel, content: String) -> MemoryItem {
        let item = MemoryItem::new(level, content);
        if self.embedder.dimensions() == 0 {
            return item;
        }
        match self.embedder.embed_one(&item.content).await {
            Ok(embedding) => item.with_embedding(embedding),
            Err(error) => {
                tracing::debug!(error = %error, "staged item left unembedded");
                item
            }
        }
    }

    async fn embedded_patch(&self, content: String) -> MemoryPatch {
        let mut patch = MemoryPatch::content(content.clone());
        if self.embedder.dimensions() > 0 {
            if let Ok(embedding) = self.embedder.embed_one(&content).await {
                patch = patch.with_embedding(embedding);
            }
        }
        patch
    }
}

// ─── Reply text composition (deterministic, no model calls) ─────────────────

fn derive_title(message: &str) -> String {
    let title: String = message.chars().take(48).collect();
    let trimmed = title.trim();
    if trimmed.is_empty() {
        "Untitled project".into()
    } else {
        trimmed.to_string()
    }
}

fn fold_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                crate::session::TurnRole::User => "user",
                crate::session::TurnRole::Assistant => "assistant",
            };
            let text: String = turn.text.chars().take(160).collect();
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The GLOBAL "world" memory item: a compact prose rendering of the world
/// facts, kept in sync with the bundle.
fn world_overview(bundle: &SettingsBundle) -> String {
    let world = &bundle.world;
    let mut lines = Vec::new();
    if let Some(genre) = &world.genre {
        lines.push(format!("Genre: {genre}."));
    }
    if let Some(era) = &world.era {
        lines.push(format!("Era: {era}."));
    }
    if !world.locations.is_empty() {
        lines.push(format!("Locations: {}.", world.locations.join(", ")));
    }
    if let Some(tech) = &world.technology_level {
        lines.push(format!("Technology: {tech}."));
    }
    for rule in &world.rules {
        lines.push(format!("Rule: {rule}."));
    }
    if !bundle.themes.is_empty() {
        lines.push(format!("Themes: {}.", bundle.themes.join(", ")));
    }
    lines.join(" ")
}

/// The CHARACTER memory item for one profile.
fn character_sheet(character: &crate::settings::CharacterProfile) -> String {
    let mut text = format!("{} ({})", character.name, character.role.as_str());
    if !character.traits.is_empty() {
        text.push_str(&format!(
            ". Traits: {}",
            character
                .traits
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if let Some(background) = &character.background {
        text.push_str(&format!(". Background: {background}"));
    }
    for (other, relation) in &character.relationships {
        text.push_str(&format!(". {relation} of {other}"));
    }
    text
}

fn clarification_text(report: &crate::consistency::ConsistencyReport) -> String {
    let conflict = report
        .errors()
        .next()
        .map_or_else(String::new, |issue| issue.description.clone());
    format!(
        "Before I change anything: {conflict}. Which version should stand? \
         I have kept the earlier setting for now."
    )
}

fn generated_text(payload: &GeneratedPayload, report: &crate::consistency::ConsistencyReport) -> String {
    let mut text = format!(
        "Chapter {} is ready — {} words.",
        payload.chapter_number, payload.word_count
    );
    if report.score < 1.0 && !report.issues.is_empty() {
        text.push_str(&format!(
            " ({} consistency note{}.)",
            report.issues.len(),
            if report.issues.len() == 1 { "" } else { "s" }
        ));
    }
    text.push_str(" Say \"continue\" for the next chapter, or ask for changes.");
    text
}

fn conversational_text(
    intent: &IntentResult,
    bundle: &SettingsBundle,
    completeness: &crate::settings::CompletenessReport,
    decision: &CreationDecision,
    notes: &[String],
) -> String {
    if !notes.is_empty() {
        return format!("{} What would you like to do?", notes.join(" "));
    }

    match intent.intent {
        IntentKind::CreateStory | IntentKind::ModifySetting => {
            let mut text = String::from("Noted.");
            if let Some(genre) = &bundle.world.genre {
                let era = bundle
                    .world
                    .era
                    .as_deref()
                    .map_or_else(String::new, |era| format!(", {era}"));
                let place = bundle
                    .world
                    .locations
                    .first()
                    .map_or_else(String::new, |l| format!(", {l}"));
                text = format!("Noted — a {genre} story{era}{place}.");
            }
            if let Some(protagonist) = bundle.protagonist() {
                text.push_str(&format!(" Protagonist: {}.", protagonist.name));
            }
            if completeness.missing.is_empty() {
                text.push_str(" Say \"write chapter 1\" whenever you want me to start.");
            } else {
                let missing: Vec<&str> = completeness
                    .missing
                    .iter()
                    .map(|slot| match slot {
                        crate::settings::RequiredSlot::Protagonist => "a protagonist",
                        crate::settings::RequiredSlot::Conflict => "a central conflict",
                        crate::settings::RequiredSlot::Genre => "the genre",
                        crate::settings::RequiredSlot::Location => "a setting",
                    })
                    .collect();
                text.push_str(&format!(" Tell me about {} next.", missing.join(", ")));
            }
            text
        }
        IntentKind::Query => {
            let characters = bundle.character_names().join(", ");
            let genre = bundle.world.genre.as_deref().unwrap_or("not set yet");
            format!(
                "So far: genre {genre}; characters: {}; {} plot thread(s).",
                if characters.is_empty() {
                    "none yet"
                } else {
                    &characters
                },
                bundle.plot_points.len()
            )
        }
        _ => {
            if decision.reason.contains("consistency") {
                "I need one clarification before writing more — could you resolve \
                 the contradiction above first?"
                    .into()
            } else {
                "I'm listening — tell me more about the story, or say \
                 \"write chapter 1\" to start."
                    .into()
            }
        }
    }
}

fn constraint_from_message(intent: &IntentResult, working: &Session) -> Vec<String> {
    if intent.intent == IntentKind::ModifyContent {
        working
            .last_user_text()
            .map(|text| vec![text.to_string()])
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}
