use super::item::MemoryLevel;
use super::vector::cosine_similarity;
use crate::error::MemoryError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Vector store seam. The in-process implementation scans exhaustively;
/// an external approximate-NN backend implements the same trait.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        level: MemoryLevel,
    ) -> Result<(), MemoryError>;

    /// Top-k ids by cosine similarity, optionally filtered by level.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        level: Option<MemoryLevel>,
    ) -> Result<Vec<(String, f32)>, MemoryError>;

    async fn remove(&self, id: &str) -> Result<(), MemoryError>;
}

/// Exact-search in-memory index. Right-sized for tests and small projects;
/// large projects point the trait at an external ANN service instead.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, (Vec<f32>, MemoryLevel)>>,
}

impl InMemoryVectorIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        level: MemoryLevel,
    ) -> Result<(), MemoryError> {
        if vector.is_empty() {
            return Err(MemoryError::VectorStore("empty vector".into()));
        }
        self.entries
            .write()
            .await
            .insert(id.to_string(), (vector, level));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        level: Option<MemoryLevel>,
    ) -> Result<Vec<(String, f32)>, MemoryError> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(String, f32)> = entries
            .iter()
            .filter(|(_, (_, entry_level))| level.map_or(true, |l| l == *entry_level))
            .map(|(id, (entry_vector, _))| (id.clone(), cosine_similarity(vector, entry_vector)))
            .collect();

        scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn remove(&self, id: &str) -> Result<(), MemoryError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}
