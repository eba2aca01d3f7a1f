// Repository seams between the engine and its persistence backing. The
// engine only ever sees these traits; the in-memory store serves tests and
// small projects, the SQLite store persists real ones.

pub mod memory_store;
pub mod sqlite;

pub use memory_store::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StorageError;
use crate::generation::{ChapterState, GenerationRecord};
use crate::memory::{MemoryItem, MemoryLevel, MemoryPatch};
use crate::session::{Session, Turn};
use crate::settings::SettingsBundle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("proj_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Repository interfaces ──────────────────────────────────────────────────

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn add_item(&self, project_id: &str, item: MemoryItem) -> Result<String, StorageError>;

    async fn update_item(
        &self,
        project_id: &str,
        id: &str,
        patch: MemoryPatch,
    ) -> Result<MemoryItem, StorageError>;

    async fn get_item(&self, project_id: &str, id: &str)
        -> Result<Option<MemoryItem>, StorageError>;

    async fn delete_item(&self, project_id: &str, id: &str) -> Result<bool, StorageError>;

    /// Items ordered by creation time, oldest first.
    async fn list_items(
        &self,
        project_id: &str,
        level: Option<MemoryLevel>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryItem>, StorageError>;

    /// Lexical search: normalized token overlap, ranked desc, ties broken
    /// by `updated_at` desc. Vector fusion happens above this seam.
    async fn search_items(
        &self,
        project_id: &str,
        query: &str,
        level: Option<MemoryLevel>,
        k: usize,
    ) -> Result<Vec<(MemoryItem, f32)>, StorageError>;
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create_project(&self, title: &str) -> Result<Project, StorageError>;
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError>;
    async fn update_project(&self, project: &Project) -> Result<(), StorageError>;
    /// Deletes the project and everything hanging off it (memory, records,
    /// settings).
    async fn delete_project(&self, id: &str) -> Result<bool, StorageError>;
    async fn list_projects(&self) -> Result<Vec<Project>, StorageError>;

    /// Persist the authoritative settings bundle for a project.
    async fn save_settings(
        &self,
        project_id: &str,
        bundle: &SettingsBundle,
    ) -> Result<(), StorageError>;

    /// Load the authoritative bundle; empty for a fresh project.
    async fn load_settings(&self, project_id: &str) -> Result<SettingsBundle, StorageError>;
}

#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn add_record(&self, record: &GenerationRecord) -> Result<(), StorageError>;

    /// Replace a stored record wholesale (content, word count, state).
    async fn update_record(&self, record: &GenerationRecord) -> Result<(), StorageError>;

    async fn update_record_state(
        &self,
        record_id: &str,
        state: ChapterState,
    ) -> Result<(), StorageError>;

    async fn get_record(&self, record_id: &str) -> Result<Option<GenerationRecord>, StorageError>;

    async fn get_current(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Option<GenerationRecord>, StorageError>;

    /// Promote one record to CURRENT, demoting any other CURRENT record of
    /// the same `(project, chapter)` to HISTORY. Atomic per key.
    async fn set_current(
        &self,
        project_id: &str,
        chapter_number: u32,
        record_id: &str,
    ) -> Result<(), StorageError>;

    /// All records of a project, ordered by chapter then creation time.
    async fn list_records(&self, project_id: &str) -> Result<Vec<GenerationRecord>, StorageError>;

    async fn history(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Vec<GenerationRecord>, StorageError>;

    /// Highest chapter number with any record, if one exists.
    async fn max_chapter(&self, project_id: &str) -> Result<Option<u32>, StorageError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, project_id: Option<&str>) -> Result<Session, StorageError>;
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError>;
    /// Whole-state upsert: turns, derived settings, summary.
    async fn save_session(&self, session: &Session) -> Result<(), StorageError>;
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), StorageError>;
    async fn evict_session(&self, session_id: &str) -> Result<bool, StorageError>;
}

// ─── End-of-turn commit ─────────────────────────────────────────────────────

/// Everything a turn wants persisted, applied all-or-nothing. Partial
/// extractions live in turn-local state until they land here, so a
/// cancelled or failed turn leaves no trace.
#[derive(Debug, Default)]
pub struct TurnWrites {
    pub memory_adds: Vec<(String, MemoryItem)>,
    pub memory_updates: Vec<(String, String, MemoryPatch)>,
    /// `(project_id, item_id)` removals (CONTEXT ring eviction).
    pub memory_deletes: Vec<(String, String)>,
    /// Authoritative bundle snapshot for the project.
    pub settings: Option<(String, SettingsBundle)>,
    /// Full session state at end of turn.
    pub session: Option<Session>,
    pub records: Vec<GenerationRecord>,
    /// `(project_id, chapter_number, record_id)` promotions to CURRENT.
    pub promote_current: Vec<(String, u32, String)>,
}

impl TurnWrites {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory_adds.is_empty()
            && self.memory_updates.is_empty()
            && self.memory_deletes.is_empty()
            && self.settings.is_none()
            && self.session.is_none()
            && self.records.is_empty()
            && self.promote_current.is_empty()
    }
}

/// The aggregate seam the agent holds: all four repositories plus the
/// atomic turn commit.
#[async_trait]
pub trait Store:
    MemoryRepository + ProjectRepository + ChapterRepository + SessionRepository
{
    async fn commit_turn(&self, writes: TurnWrites) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_writes_empty_detection() {
        assert!(TurnWrites::new().is_empty());
        let mut writes = TurnWrites::new();
        writes.session = Some(Session::new(None));
        assert!(!writes.is_empty());
    }

    #[test]
    fn project_ids_are_prefixed_and_unique() {
        let a = Project::new("Neon Rain");
        let b = Project::new("Neon Rain");
        assert!(a.id.starts_with("proj_"));
        assert_ne!(a.id, b.id);
    }
}
