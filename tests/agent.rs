//! End-to-end turns through the conversational agent over the scripted
//! mock provider: cold start, explicit generation, continuation,
//! contradiction handling, rewrite lineage and coalescing.

use fabula::agent::{AgentContext, ConversationalAgent};
use fabula::config::Config;
use fabula::generation::{ChapterState, GenerationMode};
use fabula::intent::IntentKind;
use fabula::llm::{LlmGateway, MockProvider};
use fabula::memory::{InMemoryVectorIndex, MemoryLevel, MetadataValue, NoopEmbedding};
use fabula::settings::check_completeness;
use fabula::storage::{
    ChapterRepository, InMemoryStore, MemoryRepository, ProjectRepository, SessionRepository,
};
use std::sync::Arc;

struct Harness {
    agent: Arc<ConversationalAgent>,
    provider: Arc<MockProvider>,
    store: Arc<InMemoryStore>,
}

fn harness_with(config: Config) -> Harness {
    let provider = Arc::new(MockProvider::new());
    let gateway = Arc::new(LlmGateway::new(provider.clone(), &config));
    let store = Arc::new(InMemoryStore::new());
    let agent = Arc::new(ConversationalAgent::new(AgentContext::new(
        config,
        store.clone(),
        gateway,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(NoopEmbedding),
    )));
    Harness {
        agent,
        provider,
        store,
    }
}

fn harness() -> Harness {
    harness_with(Config::default())
}

const COLD_START: &str = "I want a 2077 Shanghai cyberpunk novel, protagonist Lin Feng, \
                          ex-detective hunting a missing AI";

async fn project_id(store: &InMemoryStore) -> String {
    store
        .list_projects()
        .await
        .expect("projects should list")
        .first()
        .expect("one project should exist")
        .id
        .clone()
}

/// Scenario 1: cold start extracts a full setting but does not generate.
#[tokio::test]
async fn cold_start_extracts_settings_without_generating() {
    let h = harness();

    let reply = h.agent.chat(None, COLD_START, None).await;

    assert_eq!(reply.intent, IntentKind::CreateStory);
    assert!(reply.error.is_none());
    assert!(reply.generated.is_none(), "no chapter on a setup turn");

    let project = project_id(&h.store).await;
    let bundle = h
        .store
        .load_settings(&project)
        .await
        .expect("settings should load");

    let lin = bundle.character("Lin Feng").expect("protagonist extracted");
    assert_eq!(
        lin.role,
        fabula::settings::CharacterRole::Protagonist
    );
    assert!(lin.traits.contains("ex-detective"));
    assert_eq!(bundle.world.era.as_deref(), Some("2077"));
    assert_eq!(bundle.world.genre.as_deref(), Some("cyberpunk"));
    assert!(bundle.world.locations.iter().any(|l| l == "Shanghai"));

    let completeness = check_completeness(&bundle);
    assert!(completeness.score >= 0.7, "score {}", completeness.score);

    // Conversational confirmation, no chapter records written.
    assert!(!reply.text.is_empty());
    assert!(h
        .store
        .list_records(&project)
        .await
        .expect("records should list")
        .is_empty());
    // Rule-based turn: nothing needed the model.
    assert_eq!(h.provider.calls(), 0);
}

/// Scenario 2: "write chapter 1" produces one CURRENT record plus a PLOT
/// summary item.
#[tokio::test]
async fn explicit_generate_writes_current_chapter() {
    let h = harness();
    let setup = h.agent.chat(None, COLD_START, None).await;
    let sid = setup.session_id.clone();

    h.provider
        .push_reply("Lin Feng lit a cigarette under the maglev. The missing AI case glowed on his retina feed.");
    h.provider
        .push_reply("Lin Feng accepts the missing AI case and starts asking questions.");

    let reply = h.agent.chat(Some(&sid), "write chapter 1", None).await;

    assert_eq!(reply.intent, IntentKind::GenerateContent);
    let generated = reply.generated.expect("chapter payload expected");
    assert_eq!(generated.chapter_number, 1);
    assert!(generated.word_count > 0);
    assert!(!generated.coalesced);

    let project = project_id(&h.store).await;
    let current = h
        .store
        .get_current(&project, 1)
        .await
        .expect("current query should work")
        .expect("chapter 1 should have a current record");
    assert_eq!(current.state, ChapterState::Current);
    assert_eq!(current.id, generated.record_id);

    let plots = h
        .store
        .list_items(&project, Some(MemoryLevel::Plot), None)
        .await
        .expect("plot items should list");
    assert_eq!(plots.len(), 1);
    assert!(plots[0].content.starts_with("Chapter 1:"));

    let report = reply.consistency.expect("consistency report expected");
    assert!(report.score >= 0.5, "score {}", report.score);
}

/// Scenario 3: "continue" seeds the prompt with the tail of chapter 1 and
/// introduces no duplicate protagonists.
#[tokio::test]
async fn continue_seeds_from_previous_chapter() {
    let h = harness();
    let setup = h.agent.chat(None, COLD_START, None).await;
    let sid = setup.session_id.clone();

    h.provider
        .push_reply("Chapter one prose: Lin Feng found the first trace in a noodle stall ledger.");
    h.provider.push_reply("Lin Feng finds a trace of the AI.");
    h.agent.chat(Some(&sid), "write chapter 1", None).await;

    h.provider
        .push_reply("Chapter two prose: the ledger led Lin Feng to the flooded substation.");
    h.provider.push_reply("Lin Feng follows the trace underground.");
    let reply = h.agent.chat(Some(&sid), "continue", None).await;

    assert_eq!(reply.intent, IntentKind::ContinueContent);
    let generated = reply.generated.expect("chapter payload expected");
    assert_eq!(generated.chapter_number, 2);

    // The chapter request carried the continuation seed from chapter 1.
    let seeded = h.provider.recorded_requests().into_iter().any(|request| {
        request.messages.iter().any(|m| {
            m.content.contains("# Preceding text") && m.content.contains("noodle stall ledger")
        })
    });
    assert!(seeded, "continuation seed missing from prompts");

    let project = project_id(&h.store).await;
    let bundle = h
        .store
        .load_settings(&project)
        .await
        .expect("settings should load");
    let protagonists = bundle
        .characters
        .iter()
        .filter(|c| c.role == fabula::settings::CharacterRole::Protagonist)
        .count();
    assert_eq!(protagonists, 1, "no duplicate protagonist introduced");
}

/// Scenario 4: a contradiction is flagged, the offending rule is rolled
/// back, the statement stays in history, and nothing is generated.
#[tokio::test]
async fn contradiction_requests_clarification() {
    let h = harness();
    let setup = h.agent.chat(None, COLD_START, None).await;
    let sid = setup.session_id.clone();

    let reply = h
        .agent
        .chat(Some(&sid), "actually there's no AI at all in this world", None)
        .await;

    assert_eq!(reply.intent, IntentKind::ModifySetting);
    assert!(reply.generated.is_none(), "conflict must not generate");
    let report = reply.consistency.expect("report expected");
    assert!(report.has_errors());
    assert!(
        reply.text.contains("Which version should stand"),
        "clarification text: {}",
        reply.text
    );

    let project = project_id(&h.store).await;
    let bundle = h
        .store
        .load_settings(&project)
        .await
        .expect("settings should load");
    // Rolled back: the negation never landed.
    assert!(!bundle.world.rules.iter().any(|r| r.contains("no ai")));
    // The plot memory of the missing AI survives.
    assert!(bundle
        .plot_points
        .iter()
        .any(|p| p.summary.contains("missing AI")));

    // The user's statement stays in session history.
    let session = h
        .store
        .load_session(&sid)
        .await
        .expect("session should load")
        .expect("session should exist");
    assert!(session
        .turns
        .iter()
        .any(|t| t.text.contains("no AI at all")));

    // The conflict is recorded as an internal note.
    let contexts = h
        .store
        .list_items(&project, Some(MemoryLevel::Context), None)
        .await
        .expect("context items should list");
    assert!(contexts.iter().any(|item| {
        item.metadata.get("kind").and_then(MetadataValue::as_str) == Some("conflict_note")
    }));
}

/// Scenario 5: rewriting chapter 4 forks a new CURRENT record with
/// `parent_id` pointing at the demoted one.
#[tokio::test]
async fn rewrite_forks_current_with_lineage() {
    let h = harness();
    let setup = h.agent.chat(None, COLD_START, None).await;
    let sid = setup.session_id.clone();
    let project = project_id(&h.store).await;

    for chapter in 1..=4u32 {
        h.provider
            .push_reply(format!("Chapter {chapter} prose about Lin Feng."));
        h.provider.push_reply(format!("Summary of chapter {chapter}."));
        h.agent
            .generate_chapter(&project, chapter, GenerationMode::Full, Vec::new())
            .await
            .expect("chapter should generate");
    }
    let prior = h
        .store
        .get_current(&project, 4)
        .await
        .expect("query should work")
        .expect("chapter 4 current");

    h.provider
        .push_reply("Chapter 4, rewritten: the substation door groaned open — and the lights died.");
    h.provider.push_reply("Chapter 4 now ends on a cliffhanger.");
    let reply = h
        .agent
        .chat(Some(&sid), "rewrite chapter 4 with a cliffhanger ending", None)
        .await;

    assert_eq!(reply.intent, IntentKind::ModifyContent);
    let generated = reply.generated.expect("rewrite payload expected");
    assert_eq!(generated.chapter_number, 4);
    assert_ne!(generated.record_id, prior.id);

    let new_current = h
        .store
        .get_current(&project, 4)
        .await
        .expect("query should work")
        .expect("chapter 4 current after rewrite");
    assert_eq!(new_current.id, generated.record_id);
    assert_eq!(new_current.parent_id.as_deref(), Some(prior.id.as_str()));
    assert_eq!(new_current.chapter_number, prior.chapter_number);

    let demoted = h
        .store
        .get_record(&prior.id)
        .await
        .expect("query should work")
        .expect("prior record kept");
    assert_eq!(demoted.state, ChapterState::History);
}

/// Scenario 6: concurrent generation of the same chapter coalesces onto
/// one record.
#[tokio::test]
async fn concurrent_same_chapter_generations_coalesce() {
    let h = harness();
    h.agent.chat(None, COLD_START, None).await;
    let project = project_id(&h.store).await;

    h.provider.push_reply("Chapter five prose, written once.");
    h.provider.push_reply("Chapter five summary.");

    let (first, second) = tokio::join!(
        h.agent
            .generate_chapter(&project, 5, GenerationMode::Full, Vec::new()),
        h.agent
            .generate_chapter(&project, 5, GenerationMode::Full, Vec::new()),
    );
    let (first, first_coalesced) = first.expect("first call should succeed");
    let (second, second_coalesced) = second.expect("second call should succeed");

    assert_eq!(first.id, second.id, "both callers share one record");
    assert_ne!(first_coalesced, second_coalesced);

    let history = h
        .store
        .history(&project, 5)
        .await
        .expect("history should list");
    assert_eq!(history.len(), 1, "exactly one record was written");
}

/// Session turn cap: history never exceeds the cap and evicted turns fold
/// into the summary.
#[tokio::test]
async fn session_cap_summarizes_and_evicts() {
    let mut config = Config::default();
    config.session_turn_cap = 6;
    let h = harness_with(config);

    let first = h.agent.chat(None, COLD_START, None).await;
    let sid = first.session_id.clone();
    for i in 0..5 {
        h.agent
            .chat(Some(&sid), &format!("more ideas, round {i}"), None)
            .await;
    }

    let session = h
        .store
        .load_session(&sid)
        .await
        .expect("session should load")
        .expect("session should exist");
    assert!(
        session.turns.len() <= 6,
        "turn count {} exceeds cap",
        session.turns.len()
    );
    assert!(session.summary.is_some(), "evictions should fold into summary");
}

/// A turn on a failing provider still answers with a neutral reply and an
/// error envelope, and leaves no partial session state.
#[tokio::test]
async fn provider_failure_yields_error_envelope() {
    let config = Config::default();
    let provider = Arc::new(MockProvider::new().with_auth_failure());
    let gateway = Arc::new(LlmGateway::new(provider, &config));
    let store = Arc::new(InMemoryStore::new());
    let agent = Arc::new(ConversationalAgent::new(AgentContext::new(
        config,
        store.clone(),
        gateway,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(NoopEmbedding),
    )));

    // Cold start works without the model; generation then needs it.
    let setup = agent.chat(None, COLD_START, None).await;
    let reply = agent
        .chat(Some(&setup.session_id), "write chapter 1", None)
        .await;

    assert!(reply.generated.is_none());
    let envelope = reply.error.expect("error envelope expected");
    assert_eq!(envelope.kind, fabula::ErrorKind::Auth);
    assert!(!envelope.retryable);
    assert!(reply.text.contains("try again"));

    // No record escaped the failed turn.
    let project = project_id(&store).await;
    assert!(store
        .list_records(&project)
        .await
        .expect("records should list")
        .is_empty());
}

/// Streaming turns deliver token events before the final done event.
#[tokio::test]
async fn chat_stream_emits_tokens_then_done() {
    use fabula::agent::ChatEvent;
    use futures_util::StreamExt;

    let h = harness();
    let setup = h.agent.chat(None, COLD_START, None).await;

    h.provider.push_reply("Streamed chapter prose.");
    h.provider.push_reply("Streamed chapter summary.");

    let mut stream = h.agent.chat_stream(
        Some(setup.session_id.clone()),
        "write chapter 1".into(),
        None,
        fabula::llm::CancelToken::new(),
    );

    let mut saw_token = false;
    let mut saw_artifact = false;
    let mut saw_done = false;
    while let Some(event) = stream.next().await {
        match event {
            ChatEvent::Token(_) => saw_token = true,
            ChatEvent::Artifact(payload) => {
                saw_artifact = true;
                assert_eq!(payload.chapter_number, 1);
            }
            ChatEvent::Done(reply) => {
                saw_done = true;
                assert!(reply.error.is_none());
            }
            ChatEvent::Consistency(_) | ChatEvent::Error(_) => {}
        }
    }
    assert!(saw_token, "no token events observed");
    assert!(saw_artifact, "no artifact event observed");
    assert!(saw_done, "no done event observed");
}

/// list_generations returns records in chapter order.
#[tokio::test]
async fn list_generations_orders_by_chapter() {
    let h = harness();
    h.agent.chat(None, COLD_START, None).await;
    let project = project_id(&h.store).await;

    for chapter in [2u32, 1, 3] {
        h.provider.push_reply(format!("Prose for chapter {chapter}."));
        h.provider.push_reply(format!("Summary {chapter}."));
        h.agent
            .generate_chapter(&project, chapter, GenerationMode::Full, Vec::new())
            .await
            .expect("generation should succeed");
    }

    let records = h
        .agent
        .list_generations(&project)
        .await
        .expect("listing should work");
    let chapters: Vec<u32> = records.iter().map(|r| r.chapter_number).collect();
    assert_eq!(chapters, vec![1, 2, 3]);
}

/// Deleting a session is independent of the project.
#[tokio::test]
async fn delete_session_leaves_project_intact() {
    let h = harness();
    let reply = h.agent.chat(None, COLD_START, None).await;
    let sid = reply.session_id.clone();
    let project = project_id(&h.store).await;

    assert!(h
        .agent
        .delete_session(&sid)
        .await
        .expect("delete should work"));
    assert!(h
        .store
        .load_session(&sid)
        .await
        .expect("load should work")
        .is_none());

    // Project settings survive session deletion.
    let bundle = h
        .store
        .load_settings(&project)
        .await
        .expect("settings should load");
    assert!(bundle.character("Lin Feng").is_some());
}
