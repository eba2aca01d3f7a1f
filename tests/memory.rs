//! Cross-module memory invariants: budgeted context composition, embedding
//! freshness, ring bounds, and per-session turn ordering under concurrency.

use fabula::agent::{AgentContext, ConversationalAgent};
use fabula::config::Config;
use fabula::llm::{estimate_tokens, LlmGateway, MockProvider};
use fabula::memory::{
    HashEmbedding, InMemoryVectorIndex, LayeredMemory, MemoryLevel, MemoryPatch,
};
use fabula::session::TurnRole;
use fabula::storage::{InMemoryStore, SessionRepository};
use std::sync::Arc;

fn layered(store: Arc<InMemoryStore>) -> LayeredMemory {
    LayeredMemory::new(
        store,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(HashEmbedding::with_seed(24, 11)),
        "p1",
    )
    .with_context_cap(6)
}

#[tokio::test]
async fn build_context_respects_budget_across_scales() {
    let memory = layered(Arc::new(InMemoryStore::new()));

    for order in 0..30 {
        memory
            .add_context(
                format!("Scene {order}: {}", "rain on chrome, far sirens. ".repeat(8)),
                order,
                Some(1),
            )
            .await
            .expect("context add should work");
    }
    for i in 0..8 {
        memory
            .add_global(format!("Fact {i}: the grid rations power after midnight."))
            .await
            .expect("global add should work");
        memory
            .append_plot(format!("Chapter {i}: a lead surfaces and dies."), Some(i))
            .await
            .expect("plot add should work");
    }
    memory
        .upsert_style("tone", "noir, terse")
        .await
        .expect("style add should work");

    for budget in [150u32, 400, 1200, 4000] {
        let context = memory
            .build_context("lead surfaces grid", budget)
            .await
            .expect("context should build");
        let tokens = estimate_tokens(&context);
        assert!(
            tokens <= budget + budget / 50 + 1,
            "budget {budget} produced {tokens} tokens"
        );
    }
}

#[tokio::test]
async fn embeddings_track_content_through_updates() {
    let store = Arc::new(InMemoryStore::new());
    let memory = layered(store);

    let id = memory
        .add_global("the AI registry is public")
        .await
        .expect("add should work");
    memory
        .update(&id, MemoryPatch::content("the AI registry went dark"))
        .await
        .expect("update should work");

    memory
        .assert_embeddings_fresh()
        .await
        .expect("every embedding should match its content");

    let item = memory.get(&id).await.expect("get should work").unwrap();
    assert!(item.embedding.is_some());
    assert!(item.embedding_fresh());
}

#[tokio::test]
async fn context_ring_never_exceeds_cap() {
    let memory = layered(Arc::new(InMemoryStore::new()));
    for order in 0..40 {
        memory
            .add_context(format!("turn {order}"), order, None)
            .await
            .expect("add should work");
        let count = memory
            .list(MemoryLevel::Context, None)
            .await
            .expect("list should work")
            .len();
        assert!(count <= 6, "ring grew to {count}");
    }

    // The newest entries survived.
    let remaining = memory
        .list(MemoryLevel::Context, None)
        .await
        .expect("list should work");
    assert!(remaining.iter().any(|item| item.content == "turn 39"));
    assert!(!remaining.iter().any(|item| item.content == "turn 0"));
}

#[tokio::test]
async fn fused_search_prefers_exact_mentions() {
    let memory = layered(Arc::new(InMemoryStore::new()));
    memory
        .add_global("Lin Feng keeps an annotated map of the flooded districts")
        .await
        .expect("add should work");
    memory
        .add_global("street food vendors trade in bootleg weather data")
        .await
        .expect("add should work");
    memory
        .add_global("Lin Feng owes the fixer two favors")
        .await
        .expect("add should work");

    let hits = memory
        .search("Lin Feng", None, 2)
        .await
        .expect("search should work");
    assert_eq!(hits.len(), 2);
    for (item, score) in &hits {
        assert!(item.content.contains("Lin Feng"), "hit: {}", item.content);
        assert!(*score > 0.0);
    }
}

/// Two concurrent chats on one session serialize: the committed history
/// alternates user/assistant and both turns land.
#[tokio::test]
async fn concurrent_chats_serialize_within_a_session() {
    let config = Config::default();
    let provider = Arc::new(MockProvider::new());
    let gateway = Arc::new(LlmGateway::new(provider, &config));
    let store = Arc::new(InMemoryStore::new());
    let agent = Arc::new(ConversationalAgent::new(AgentContext::new(
        config,
        store.clone(),
        gateway,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(fabula::memory::NoopEmbedding),
    )));

    let first = agent
        .chat(None, "I want a mystery novel set in Venice", None)
        .await;
    let sid = first.session_id.clone();

    let a = {
        let agent = Arc::clone(&agent);
        let sid = sid.clone();
        tokio::spawn(async move { agent.chat(Some(&sid), "the detective is named Ada", None).await })
    };
    let b = {
        let agent = Arc::clone(&agent);
        let sid = sid.clone();
        tokio::spawn(async move { agent.chat(Some(&sid), "set it during carnival week", None).await })
    };
    let (a, b) = (a.await.expect("task a"), b.await.expect("task b"));
    assert!(a.error.is_none());
    assert!(b.error.is_none());

    let session = store
        .load_session(&sid)
        .await
        .expect("load should work")
        .expect("session should exist");
    // 3 turns from the caller, each followed by one assistant turn.
    assert_eq!(session.turns.len(), 6);
    for pair in session.turns.chunks(2) {
        assert_eq!(pair[0].role, TurnRole::User);
        assert_eq!(pair[1].role, TurnRole::Assistant);
    }
    assert!(session.turns_well_formed());
    // Both concurrent turns are present.
    assert!(session.turns.iter().any(|t| t.text.contains("Ada")));
    assert!(session.turns.iter().any(|t| t.text.contains("carnival")));
}
