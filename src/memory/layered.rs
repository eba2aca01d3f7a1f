use super::embeddings::EmbeddingProvider;
use super::index::VectorStore;
use super::item::{
    MemoryItem, MemoryLevel, MemoryPatch, META_ASPECT, META_CHAPTER, META_CHARACTER, META_ORDER,
};
use super::vector::{fuse_ranked, ScoredId};
use crate::error::{MemoryError, StorageError};
use crate::storage::MemoryRepository;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Five-tier story memory for one project.
///
/// Wraps the memory repository with tier semantics: CONTEXT ring buffer,
/// STYLE upsert-by-aspect, CHARACTER merge-by-name, and fused
/// lexical+vector retrieval. The repository stays the source of truth; the
/// vector index mirrors it.
pub struct LayeredMemory {
    repo: Arc<dyn MemoryRepository>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    project_id: String,
    context_cap: usize,
    retrieval_k: usize,
    vector_timeout: Duration,
}

impl LayeredMemory {
    pub fn new(
        repo: Arc<dyn MemoryRepository>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            vectors,
            embedder,
            project_id: project_id.into(),
            context_cap: 12,
            retrieval_k: 8,
            vector_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_context_cap(mut self, cap: usize) -> Self {
        self.context_cap = cap.max(1);
        self
    }

    #[must_use]
    pub fn with_retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k.max(1);
        self
    }

    #[must_use]
    pub fn with_vector_timeout(mut self, timeout: Duration) -> Self {
        self.vector_timeout = timeout;
        self
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    #[must_use]
    pub fn retrieval_k(&self) -> usize {
        self.retrieval_k
    }

    // ── Core operations ─────────────────────────────────────────

    /// Add an item, embedding its content when an embedder is configured.
    /// Embedding failure degrades to keyword-only retrieval, it never
    /// fails the write.
    pub async fn add(&self, mut item: MemoryItem) -> Result<String, StorageError> {
        if self.embedder.dimensions() > 0 {
            match self.embedder.embed_one(&item.content).await {
                Ok(embedding) => item = item.with_embedding(embedding),
                Err(error) => {
                    tracing::warn!(error = %error, "embedding skipped for new memory item");
                }
            }
        }

        let level = item.level;
        let embedding = item.embedding.clone();
        let id = self.repo.add_item(&self.project_id, item).await?;

        if let Some(embedding) = embedding {
            self.upsert_vector(&id, embedding, level).await;
        }

        if level == MemoryLevel::Context {
            self.enforce_context_ring().await?;
        }
        Ok(id)
    }

    /// Update an item. A content change recomputes the embedding so the
    /// stored vector never drifts from the text it indexes.
    pub async fn update(&self, id: &str, mut patch: MemoryPatch) -> Result<MemoryItem, StorageError> {
        if let Some(content) = &patch.content {
            if self.embedder.dimensions() > 0 {
                match self.embedder.embed_one(content).await {
                    Ok(embedding) => patch.embedding = Some(embedding),
                    Err(error) => {
                        tracing::warn!(error = %error, "embedding skipped for updated memory item");
                    }
                }
            }
        }

        let updated = self.repo.update_item(&self.project_id, id, patch).await?;
        if let Some(embedding) = updated.embedding.clone() {
            self.upsert_vector(id, embedding, updated.level).await;
        }
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryItem>, StorageError> {
        self.repo.get_item(&self.project_id, id).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let removed = self.repo.delete_item(&self.project_id, id).await?;
        if removed {
            let _ = self.vectors.remove(id).await;
        }
        Ok(removed)
    }

    pub async fn list(
        &self,
        level: MemoryLevel,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryItem>, StorageError> {
        self.repo
            .list_items(&self.project_id, Some(level), limit)
            .await
    }

    /// Fused search: `0.5·lexical + 0.5·cosine`, ties by recency.
    pub async fn search(
        &self,
        query: &str,
        level: Option<MemoryLevel>,
        k: usize,
    ) -> Result<Vec<(MemoryItem, f32)>, StorageError> {
        let pool = k.max(1) * 2;
        let lexical = self
            .repo
            .search_items(&self.project_id, query, level, pool)
            .await?;

        let vector_hits = self.vector_query(query, pool, level).await;

        let mut by_id: HashMap<String, (Option<MemoryItem>, Option<f32>, Option<f32>)> =
            HashMap::new();
        for (item, score) in lexical {
            by_id.insert(item.id.clone(), (Some(item), Some(score), None));
        }
        for (id, score) in vector_hits {
            if let Some(entry) = by_id.get_mut(&id) {
                entry.2 = Some(score);
                continue;
            }
            let item = self.repo.get_item(&self.project_id, &id).await?;
            if let Some(item) = item {
                if level.map_or(true, |l| item.level == l) {
                    by_id.insert(id, (Some(item), None, Some(score)));
                }
            }
        }

        let mut hits = Vec::new();
        let mut items: HashMap<String, MemoryItem> = HashMap::new();
        for (id, (item, lexical, vector)) in by_id {
            let Some(item) = item else { continue };
            hits.push(ScoredId {
                id: id.clone(),
                lexical,
                vector,
                updated_at: item.updated_at,
            });
            items.insert(id, item);
        }

        Ok(fuse_ranked(hits, k)
            .into_iter()
            .filter_map(|(scored, score)| items.remove(&scored.id).map(|item| (item, score)))
            .collect())
    }

    // ── Tier-specific writes ────────────────────────────────────

    /// Append a turn or chapter excerpt to the CONTEXT ring.
    pub async fn add_context(
        &self,
        content: impl Into<String>,
        order: i64,
        chapter: Option<u32>,
    ) -> Result<String, StorageError> {
        let mut item =
            MemoryItem::new(MemoryLevel::Context, content).with_metadata(META_ORDER, order);
        if let Some(chapter) = chapter {
            item = item.with_metadata(META_CHAPTER, i64::from(chapter));
        }
        self.add(item).await
    }

    /// Append a plot point summary (PLOT is append-only, ordered).
    pub async fn append_plot(
        &self,
        summary: impl Into<String>,
        chapter: Option<u32>,
    ) -> Result<String, StorageError> {
        let mut item = MemoryItem::new(MemoryLevel::Plot, summary);
        if let Some(chapter) = chapter {
            item = item.with_metadata(META_CHAPTER, i64::from(chapter));
        }
        self.add(item).await
    }

    /// One logical CHARACTER item per name; repeated writes replace the
    /// profile text for that character.
    pub async fn upsert_character(
        &self,
        name: &str,
        content: impl Into<String>,
    ) -> Result<String, StorageError> {
        let existing = self
            .list(MemoryLevel::Character, None)
            .await?
            .into_iter()
            .find(|item| item.character_name() == Some(name));

        match existing {
            Some(item) => {
                self.update(&item.id, MemoryPatch::content(content)).await?;
                Ok(item.id)
            }
            None => {
                let item = MemoryItem::new(MemoryLevel::Character, content)
                    .with_metadata(META_CHARACTER, name);
                self.add(item).await
            }
        }
    }

    /// STYLE items are singletons per aspect.
    pub async fn upsert_style(
        &self,
        aspect: &str,
        content: impl Into<String>,
    ) -> Result<String, StorageError> {
        let existing = self
            .list(MemoryLevel::Style, None)
            .await?
            .into_iter()
            .find(|item| item.aspect() == Some(aspect));

        match existing {
            Some(item) => {
                self.update(&item.id, MemoryPatch::content(content)).await?;
                Ok(item.id)
            }
            None => {
                let item = MemoryItem::new(MemoryLevel::Style, content)
                    .with_metadata(META_ASPECT, aspect);
                self.add(item).await
            }
        }
    }

    /// Add a GLOBAL fact.
    pub async fn add_global(&self, content: impl Into<String>) -> Result<String, StorageError> {
        self.add(MemoryItem::new(MemoryLevel::Global, content)).await
    }

    // ── Internals ───────────────────────────────────────────────

    async fn upsert_vector(&self, id: &str, embedding: Vec<f32>, level: MemoryLevel) {
        let upsert = self.vectors.upsert(id, embedding, level);
        match tokio::time::timeout(self.vector_timeout, upsert).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(id, error = %error, "vector upsert failed");
            }
            Err(_) => {
                tracing::warn!(id, "vector upsert timed out");
            }
        }
    }

    async fn vector_query(
        &self,
        query: &str,
        k: usize,
        level: Option<MemoryLevel>,
    ) -> Vec<(String, f32)> {
        if self.embedder.dimensions() == 0 {
            return Vec::new();
        }
        let embedding = match self.embedder.embed_one(query).await {
            Ok(embedding) => embedding,
            Err(error) => {
                tracing::debug!(error = %error, "query embedding unavailable");
                return Vec::new();
            }
        };
        match tokio::time::timeout(self.vector_timeout, self.vectors.query(&embedding, k, level))
            .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "vector query failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("vector query timed out");
                Vec::new()
            }
        }
    }

    /// Oldest CONTEXT items (by `order`) fall out once the ring exceeds
    /// its bound.
    async fn enforce_context_ring(&self) -> Result<(), StorageError> {
        let mut items = self.list(MemoryLevel::Context, None).await?;
        if items.len() <= self.context_cap {
            return Ok(());
        }
        items.sort_by_key(|item| item.order().unwrap_or(i64::MIN));
        let excess = items.len() - self.context_cap;
        for item in items.into_iter().take(excess) {
            tracing::debug!(id = item.id.as_str(), "context ring eviction");
            self.delete(&item.id).await?;
        }
        Ok(())
    }
}

/// Convenience used by tests and offline tools.
impl LayeredMemory {
    pub async fn assert_embeddings_fresh(&self) -> Result<(), MemoryError> {
        for level in MemoryLevel::ALL {
            let items = self
                .list(level, None)
                .await
                .map_err(|e| MemoryError::VectorStore(e.to_string()))?;
            for item in items {
                if !item.embedding_fresh() {
                    return Err(MemoryError::Embedding(format!(
                        "stale embedding on {}",
                        item.id
                    )));
                }
            }
        }
        Ok(())
    }
}
