use super::{
    ChapterRepository, MemoryRepository, Project, ProjectRepository, SessionRepository, Store,
    TurnWrites,
};
use crate::error::StorageError;
use crate::generation::{ChapterState, GenerationRecord};
use crate::memory::{vector::lexical_overlap, MemoryItem, MemoryLevel, MemoryPatch};
use crate::session::{Session, Turn};
use crate::settings::SettingsBundle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Single-lock in-memory store. One mutex over the whole state makes every
/// operation atomic, the end-of-turn commit included.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    projects: HashMap<String, Project>,
    /// `project_id` → id → item.
    items: HashMap<String, HashMap<String, MemoryItem>>,
    /// insertion order of item ids per project, for stable listing.
    item_order: HashMap<String, Vec<String>>,
    records: HashMap<String, GenerationRecord>,
    /// `(project_id, chapter_number)` → CURRENT record id.
    current: HashMap<(String, u32), String>,
    sessions: HashMap<String, Session>,
    settings: HashMap<String, SettingsBundle>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_set_current(
    state: &mut State,
    project_id: &str,
    chapter_number: u32,
    record_id: &str,
) -> Result<(), StorageError> {
    let record = state
        .records
        .get(record_id)
        .ok_or_else(|| StorageError::NotFound {
            entity: "generation record",
            id: record_id.to_string(),
        })?;
    if record.project_id != project_id || record.chapter_number != chapter_number {
        return Err(StorageError::Conflict(format!(
            "record {record_id} does not belong to {project_id}#{chapter_number}"
        )));
    }

    let key = (project_id.to_string(), chapter_number);
    if let Some(previous_id) = state.current.get(&key).cloned() {
        if previous_id != record_id {
            if let Some(previous) = state.records.get_mut(&previous_id) {
                previous.state = ChapterState::History;
            }
        }
    }
    if let Some(record) = state.records.get_mut(record_id) {
        record.state = ChapterState::Current;
    }
    state.current.insert(key, record_id.to_string());
    Ok(())
}

fn apply_add_item(state: &mut State, project_id: &str, item: MemoryItem) -> String {
    let id = item.id.clone();
    state
        .item_order
        .entry(project_id.to_string())
        .or_default()
        .push(id.clone());
    state
        .items
        .entry(project_id.to_string())
        .or_default()
        .insert(id.clone(), item);
    id
}

#[async_trait]
impl MemoryRepository for InMemoryStore {
    async fn add_item(&self, project_id: &str, item: MemoryItem) -> Result<String, StorageError> {
        Ok(apply_add_item(&mut self.lock(), project_id, item))
    }

    async fn update_item(
        &self,
        project_id: &str,
        id: &str,
        patch: MemoryPatch,
    ) -> Result<MemoryItem, StorageError> {
        let mut state = self.lock();
        let item = state
            .items
            .get_mut(project_id)
            .and_then(|items| items.get_mut(id))
            .ok_or_else(|| StorageError::NotFound {
                entity: "memory item",
                id: id.to_string(),
            })?;
        patch.apply(item);
        Ok(item.clone())
    }

    async fn get_item(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<MemoryItem>, StorageError> {
        Ok(self
            .lock()
            .items
            .get(project_id)
            .and_then(|items| items.get(id))
            .cloned())
    }

    async fn delete_item(&self, project_id: &str, id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let removed = state
            .items
            .get_mut(project_id)
            .map_or(false, |items| items.remove(id).is_some());
        if removed {
            if let Some(order) = state.item_order.get_mut(project_id) {
                order.retain(|existing| existing != id);
            }
        }
        Ok(removed)
    }

    async fn list_items(
        &self,
        project_id: &str,
        level: Option<MemoryLevel>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryItem>, StorageError> {
        let state = self.lock();
        let Some(items) = state.items.get(project_id) else {
            return Ok(Vec::new());
        };
        let order = state.item_order.get(project_id);
        let mut listed: Vec<MemoryItem> = match order {
            Some(order) => order
                .iter()
                .filter_map(|id| items.get(id))
                .filter(|item| level.map_or(true, |l| item.level == l))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        if let Some(limit) = limit {
            listed.truncate(limit);
        }
        Ok(listed)
    }

    async fn search_items(
        &self,
        project_id: &str,
        query: &str,
        level: Option<MemoryLevel>,
        k: usize,
    ) -> Result<Vec<(MemoryItem, f32)>, StorageError> {
        let state = self.lock();
        let Some(items) = state.items.get(project_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(MemoryItem, f32)> = items
            .values()
            .filter(|item| level.map_or(true, |l| item.level == l))
            .map(|item| (item.clone(), lexical_overlap(query, &item.content)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|(a, score_a), (b, score_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl ProjectRepository for InMemoryStore {
    async fn create_project(&self, title: &str) -> Result<Project, StorageError> {
        let project = Project::new(title);
        self.lock()
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        Ok(self.lock().projects.get(id).cloned())
    }

    async fn update_project(&self, project: &Project) -> Result<(), StorageError> {
        let mut state = self.lock();
        if !state.projects.contains_key(&project.id) {
            return Err(StorageError::NotFound {
                entity: "project",
                id: project.id.clone(),
            });
        }
        state.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let existed = state.projects.remove(id).is_some();
        if existed {
            state.items.remove(id);
            state.item_order.remove(id);
            state.records.retain(|_, record| record.project_id != id);
            state.current.retain(|(project, _), _| project != id);
            state.settings.remove(id);
        }
        Ok(existed)
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let mut projects: Vec<Project> = self.lock().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    async fn save_settings(
        &self,
        project_id: &str,
        bundle: &SettingsBundle,
    ) -> Result<(), StorageError> {
        self.lock()
            .settings
            .insert(project_id.to_string(), bundle.clone());
        Ok(())
    }

    async fn load_settings(&self, project_id: &str) -> Result<SettingsBundle, StorageError> {
        Ok(self
            .lock()
            .settings
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChapterRepository for InMemoryStore {
    async fn add_record(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        self.lock()
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        let mut state = self.lock();
        if !state.records.contains_key(&record.id) {
            return Err(StorageError::NotFound {
                entity: "generation record",
                id: record.id.clone(),
            });
        }
        state.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_record_state(
        &self,
        record_id: &str,
        new_state: ChapterState,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(record_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "generation record",
                id: record_id.to_string(),
            })?;
        record.state = new_state;
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<GenerationRecord>, StorageError> {
        Ok(self.lock().records.get(record_id).cloned())
    }

    async fn get_current(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Option<GenerationRecord>, StorageError> {
        let state = self.lock();
        Ok(state
            .current
            .get(&(project_id.to_string(), chapter_number))
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn set_current(
        &self,
        project_id: &str,
        chapter_number: u32,
        record_id: &str,
    ) -> Result<(), StorageError> {
        apply_set_current(&mut self.lock(), project_id, chapter_number, record_id)
    }

    async fn list_records(&self, project_id: &str) -> Result<Vec<GenerationRecord>, StorageError> {
        let state = self.lock();
        let mut records: Vec<GenerationRecord> = state
            .records
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.chapter_number
                .cmp(&b.chapter_number)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(records)
    }

    async fn history(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Vec<GenerationRecord>, StorageError> {
        let state = self.lock();
        let mut records: Vec<GenerationRecord> = state
            .records
            .values()
            .filter(|record| {
                record.project_id == project_id && record.chapter_number == chapter_number
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn max_chapter(&self, project_id: &str) -> Result<Option<u32>, StorageError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|record| record.project_id == project_id)
            .map(|record| record.chapter_number)
            .max())
    }
}

#[async_trait]
impl SessionRepository for InMemoryStore {
    async fn create_session(&self, project_id: Option<&str>) -> Result<Session, StorageError> {
        let session = Session::new(project_id.map(str::to_string));
        self.lock()
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.lock()
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), StorageError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;
        session.push_turn(turn);
        Ok(())
    }

    async fn evict_session(&self, session_id: &str) -> Result<bool, StorageError> {
        Ok(self.lock().sessions.remove(session_id).is_some())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn commit_turn(&self, writes: TurnWrites) -> Result<(), StorageError> {
        // One lock acquisition: all writes land or none do. Validation runs
        // before any mutation so a failure cannot leave a partial commit.
        let mut state = self.lock();

        for (_, _, record_id) in &writes.promote_current {
            let known = state.records.contains_key(record_id)
                || writes.records.iter().any(|r| &r.id == record_id);
            if !known {
                return Err(StorageError::NotFound {
                    entity: "generation record",
                    id: record_id.clone(),
                });
            }
        }
        for (project_id, id, _) in &writes.memory_updates {
            let exists = state
                .items
                .get(project_id)
                .map_or(false, |items| items.contains_key(id));
            if !exists {
                return Err(StorageError::NotFound {
                    entity: "memory item",
                    id: id.clone(),
                });
            }
        }

        for (project_id, item) in writes.memory_adds {
            apply_add_item(&mut state, &project_id, item);
        }
        for (project_id, id) in writes.memory_deletes {
            if let Some(items) = state.items.get_mut(&project_id) {
                items.remove(&id);
            }
            if let Some(order) = state.item_order.get_mut(&project_id) {
                order.retain(|existing| *existing != id);
            }
        }
        for (project_id, id, patch) in writes.memory_updates {
            if let Some(item) = state
                .items
                .get_mut(&project_id)
                .and_then(|items| items.get_mut(&id))
            {
                patch.apply(item);
            }
        }
        for record in writes.records {
            state.records.insert(record.id.clone(), record);
        }
        for (project_id, chapter_number, record_id) in writes.promote_current {
            apply_set_current(&mut state, &project_id, chapter_number, &record_id)?;
        }
        if let Some((project_id, bundle)) = writes.settings {
            state.settings.insert(project_id, bundle);
        }
        if let Some(session) = writes.session {
            state.sessions.insert(session.session_id.clone(), session);
        }
        Ok(())
    }
}
