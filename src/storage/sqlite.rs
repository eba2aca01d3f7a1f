use super::{
    ChapterRepository, MemoryRepository, Project, ProjectRepository, SessionRepository, Store,
    TurnWrites,
};
use crate::error::StorageError;
use crate::generation::{ChapterState, GenerationMode, GenerationRecord};
use crate::memory::{vector::lexical_overlap, MemoryItem, MemoryLevel, MemoryPatch};
use crate::session::{Session, Turn};
use crate::settings::{CharacterProfile, SettingsBundle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// SQLite-backed store over an sqlx async pool. Schema is created at
/// construction; the end-of-turn commit runs in one transaction.
pub struct SqliteStore {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id         TEXT PRIMARY KEY,
        title      TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS memory_items (
        id            TEXT PRIMARY KEY,
        project_id    TEXT NOT NULL,
        level         TEXT NOT NULL,
        content       TEXT NOT NULL,
        metadata      TEXT NOT NULL,
        embedding     BLOB,
        embedded_hash TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_memory_project_level
        ON memory_items (project_id, level)",
    "CREATE TABLE IF NOT EXISTS chapters (
        record_id            TEXT PRIMARY KEY,
        project_id           TEXT NOT NULL,
        chapter_number       INTEGER NOT NULL,
        mode                 TEXT NOT NULL,
        state                TEXT NOT NULL,
        content              TEXT NOT NULL,
        word_count           INTEGER NOT NULL,
        parent_id            TEXT,
        settings_fingerprint TEXT NOT NULL,
        created_at           TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_chapters_project
        ON chapters (project_id, chapter_number)",
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id            TEXT PRIMARY KEY,
        project_id            TEXT,
        turns_json            TEXT NOT NULL,
        derived_settings_json TEXT NOT NULL,
        summary               TEXT,
        updated_at            TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS characters (
        project_id TEXT NOT NULL,
        name       TEXT NOT NULL,
        data_json  TEXT NOT NULL,
        PRIMARY KEY (project_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS world_settings (
        project_id TEXT PRIMARY KEY,
        data_json  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS plot_points (
        project_id TEXT NOT NULL,
        seq        INTEGER NOT NULL,
        data_json  TEXT NOT NULL,
        PRIMARY KEY (project_id, seq)
    )",
];

/// World row payload: everything in the bundle that is not a character or
/// a plot point.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct WorldRow {
    world: crate::settings::WorldSetting,
    themes: Vec<String>,
    style_hints: std::collections::BTreeMap<String, String>,
}

impl SqliteStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Self::new(pool).await
    }
}

// ── Row mapping ──────────────────────────────────────────────────

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for &f in v {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    bytes
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

fn item_from_row(row: &SqliteRow) -> Result<MemoryItem, StorageError> {
    let level: String = row.try_get("level")?;
    let metadata: String = row.try_get("metadata")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(MemoryItem {
        id: row.try_get("id")?,
        level: level
            .parse()
            .map_err(|e: anyhow::Error| StorageError::Backend(e.to_string()))?,
        content: row.try_get("content")?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| StorageError::Backend(format!("metadata decode: {e}")))?,
        embedding: embedding.map(|bytes| bytes_to_vec(&bytes)),
        embedded_content_hash: row.try_get("embedded_hash")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn record_from_row(row: &SqliteRow) -> Result<GenerationRecord, StorageError> {
    let mode: String = row.try_get("mode")?;
    let state: String = row.try_get("state")?;
    let chapter_number: i64 = row.try_get("chapter_number")?;
    let word_count: i64 = row.try_get("word_count")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(GenerationRecord {
        id: row.try_get("record_id")?,
        project_id: row.try_get("project_id")?,
        chapter_number: u32::try_from(chapter_number)
            .map_err(|_| StorageError::Backend("negative chapter number".into()))?,
        mode: mode
            .parse::<GenerationMode>()
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        state: state
            .parse::<ChapterState>()
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        content: row.try_get("content")?,
        word_count: u32::try_from(word_count).unwrap_or(0),
        parent_id: row.try_get("parent_id")?,
        settings_fingerprint: row.try_get("settings_fingerprint")?,
        created_at: parse_timestamp(&created_at),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let turns_json: String = row.try_get("turns_json")?;
    let settings_json: String = row.try_get("derived_settings_json")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Session {
        session_id: row.try_get("session_id")?,
        project_id: row.try_get("project_id")?,
        turns: serde_json::from_str(&turns_json)
            .map_err(|e| StorageError::Backend(format!("turns decode: {e}")))?,
        derived_settings: serde_json::from_str(&settings_json)
            .map_err(|e| StorageError::Backend(format!("settings decode: {e}")))?,
        summary: row.try_get("summary")?,
        updated_at: parse_timestamp(&updated_at),
    })
}

async fn insert_item<'e, E>(executor: E, project_id: &str, item: &MemoryItem) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT OR REPLACE INTO memory_items
         (id, project_id, level, content, metadata, embedding, embedded_hash, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&item.id)
    .bind(project_id)
    .bind(item.level.as_str())
    .bind(&item.content)
    .bind(serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".into()))
    .bind(item.embedding.as_deref().map(vec_to_bytes))
    .bind(&item.embedded_content_hash)
    .bind(item.created_at.to_rfc3339())
    .bind(item.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_record<'e, E>(executor: E, record: &GenerationRecord) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT OR REPLACE INTO chapters
         (record_id, project_id, chapter_number, mode, state, content, word_count,
          parent_id, settings_fingerprint, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&record.id)
    .bind(&record.project_id)
    .bind(i64::from(record.chapter_number))
    .bind(record.mode.as_str())
    .bind(record.state.as_str())
    .bind(&record.content)
    .bind(i64::from(record.word_count))
    .bind(&record.parent_id)
    .bind(&record.settings_fingerprint)
    .bind(record.created_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_session<'e, E>(executor: E, session: &Session) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT OR REPLACE INTO sessions
         (session_id, project_id, turns_json, derived_settings_json, summary, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&session.session_id)
    .bind(&session.project_id)
    .bind(serde_json::to_string(&session.turns).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&session.derived_settings).unwrap_or_else(|_| "{}".into()))
    .bind(&session.summary)
    .bind(session.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MemoryRepository for SqliteStore {
    async fn add_item(&self, project_id: &str, item: MemoryItem) -> Result<String, StorageError> {
        insert_item(&self.pool, project_id, &item).await?;
        Ok(item.id)
    }

    async fn update_item(
        &self,
        project_id: &str,
        id: &str,
        patch: MemoryPatch,
    ) -> Result<MemoryItem, StorageError> {
        let mut item = self
            .get_item(project_id, id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "memory item",
                id: id.to_string(),
            })?;
        patch.apply(&mut item);
        insert_item(&self.pool, project_id, &item).await?;
        Ok(item)
    }

    async fn get_item(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<MemoryItem>, StorageError> {
        let row = sqlx::query("SELECT * FROM memory_items WHERE project_id = $1 AND id = $2")
            .bind(project_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn delete_item(&self, project_id: &str, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM memory_items WHERE project_id = $1 AND id = $2")
            .bind(project_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_items(
        &self,
        project_id: &str,
        level: Option<MemoryLevel>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryItem>, StorageError> {
        let rows = match level {
            Some(level) => {
                sqlx::query(
                    "SELECT * FROM memory_items
                     WHERE project_id = $1 AND level = $2
                     ORDER BY created_at ASC",
                )
                .bind(project_id)
                .bind(level.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM memory_items WHERE project_id = $1 ORDER BY created_at ASC",
                )
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut items: Vec<MemoryItem> = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<_, _>>()?;
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn search_items(
        &self,
        project_id: &str,
        query: &str,
        level: Option<MemoryLevel>,
        k: usize,
    ) -> Result<Vec<(MemoryItem, f32)>, StorageError> {
        // Lexical scoring runs in-process so both store implementations
        // rank identically.
        let items = self.list_items(project_id, level, None).await?;
        let mut scored: Vec<(MemoryItem, f32)> = items
            .into_iter()
            .map(|item| {
                let score = lexical_overlap(query, &item.content);
                (item, score)
            })
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
impl ProjectRepository for SqliteStore {
    async fn create_project(&self, title: &str) -> Result<Project, StorageError> {
        let project = Project::new(title);
        sqlx::query(
            "INSERT INTO projects (id, title, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&project.id)
        .bind(&project.title)
        .bind(project.created_at.to_rfc3339())
        .bind(project.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let created_at: String = row.try_get("created_at")?;
            let updated_at: String = row.try_get("updated_at")?;
            Ok(Project {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                created_at: parse_timestamp(&created_at),
                updated_at: parse_timestamp(&updated_at),
            })
        })
        .transpose()
    }

    async fn update_project(&self, project: &Project) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE projects SET title = $1, updated_at = $2 WHERE id = $3")
            .bind(&project.title)
            .bind(Utc::now().to_rfc3339())
            .bind(&project.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "project",
                id: project.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for table in [
            "memory_items",
            "chapters",
            "characters",
            "world_settings",
            "plot_points",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE project_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let created_at: String = row.try_get("created_at")?;
                let updated_at: String = row.try_get("updated_at")?;
                Ok(Project {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    created_at: parse_timestamp(&created_at),
                    updated_at: parse_timestamp(&updated_at),
                })
            })
            .collect()
    }

    async fn save_settings(
        &self,
        project_id: &str,
        bundle: &SettingsBundle,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        save_settings_in_tx(&mut tx, project_id, bundle).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_settings(&self, project_id: &str) -> Result<SettingsBundle, StorageError> {
        let world_row = sqlx::query("SELECT data_json FROM world_settings WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        let world: WorldRow = match world_row {
            Some(row) => {
                let json: String = row.try_get("data_json")?;
                serde_json::from_str(&json)
                    .map_err(|e| StorageError::Backend(format!("world decode: {e}")))?
            }
            None => WorldRow::default(),
        };

        let character_rows =
            sqlx::query("SELECT data_json FROM characters WHERE project_id = $1 ORDER BY name")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        let mut characters = Vec::with_capacity(character_rows.len());
        for row in character_rows {
            let json: String = row.try_get("data_json")?;
            let character: CharacterProfile = serde_json::from_str(&json)
                .map_err(|e| StorageError::Backend(format!("character decode: {e}")))?;
            characters.push(character);
        }

        let plot_rows =
            sqlx::query("SELECT data_json FROM plot_points WHERE project_id = $1 ORDER BY seq")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        let mut plot_points = Vec::with_capacity(plot_rows.len());
        for row in plot_rows {
            let json: String = row.try_get("data_json")?;
            let point = serde_json::from_str(&json)
                .map_err(|e| StorageError::Backend(format!("plot point decode: {e}")))?;
            plot_points.push(point);
        }

        Ok(SettingsBundle {
            characters,
            world: world.world,
            plot_points,
            themes: world.themes,
            style_hints: world.style_hints,
        })
    }
}

async fn save_settings_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    bundle: &SettingsBundle,
) -> Result<(), StorageError> {
    for table in ["characters", "world_settings", "plot_points"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE project_id = $1"))
            .bind(project_id)
            .execute(&mut **tx)
            .await?;
    }

    for character in &bundle.characters {
        sqlx::query("INSERT INTO characters (project_id, name, data_json) VALUES ($1, $2, $3)")
            .bind(project_id)
            .bind(&character.name)
            .bind(
                serde_json::to_string(character)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .execute(&mut **tx)
            .await?;
    }

    let world = WorldRow {
        world: bundle.world.clone(),
        themes: bundle.themes.clone(),
        style_hints: bundle.style_hints.clone(),
    };
    sqlx::query("INSERT INTO world_settings (project_id, data_json) VALUES ($1, $2)")
        .bind(project_id)
        .bind(serde_json::to_string(&world).map_err(|e| StorageError::Backend(e.to_string()))?)
        .execute(&mut **tx)
        .await?;

    for (seq, point) in bundle.plot_points.iter().enumerate() {
        sqlx::query("INSERT INTO plot_points (project_id, seq, data_json) VALUES ($1, $2, $3)")
            .bind(project_id)
            .bind(i64::try_from(seq).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(point).map_err(|e| StorageError::Backend(e.to_string()))?)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

#[async_trait]
impl ChapterRepository for SqliteStore {
    async fn add_record(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        insert_record(&self.pool, record).await
    }

    async fn update_record(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        insert_record(&self.pool, record).await
    }

    async fn update_record_state(
        &self,
        record_id: &str,
        state: ChapterState,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE chapters SET state = $1 WHERE record_id = $2")
            .bind(state.as_str())
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "generation record",
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<GenerationRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM chapters WHERE record_id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_current(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Option<GenerationRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM chapters
             WHERE project_id = $1 AND chapter_number = $2 AND state = 'current'",
        )
        .bind(project_id)
        .bind(i64::from(chapter_number))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn set_current(
        &self,
        project_id: &str,
        chapter_number: u32,
        record_id: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        set_current_in_tx(&mut tx, project_id, chapter_number, record_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_records(&self, project_id: &str) -> Result<Vec<GenerationRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM chapters WHERE project_id = $1
             ORDER BY chapter_number ASC, created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn history(
        &self,
        project_id: &str,
        chapter_number: u32,
    ) -> Result<Vec<GenerationRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM chapters
             WHERE project_id = $1 AND chapter_number = $2
             ORDER BY created_at ASC",
        )
        .bind(project_id)
        .bind(i64::from(chapter_number))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn max_chapter(&self, project_id: &str) -> Result<Option<u32>, StorageError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT MAX(chapter_number) FROM chapters WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row
            .and_then(|(max,)| max)
            .and_then(|max| u32::try_from(max).ok()))
    }
}

async fn set_current_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    chapter_number: u32,
    record_id: &str,
) -> Result<(), StorageError> {
    let row = sqlx::query("SELECT project_id, chapter_number FROM chapters WHERE record_id = $1")
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Err(StorageError::NotFound {
            entity: "generation record",
            id: record_id.to_string(),
        });
    };
    let owner: String = row.try_get("project_id")?;
    let chapter: i64 = row.try_get("chapter_number")?;
    if owner != project_id || chapter != i64::from(chapter_number) {
        return Err(StorageError::Conflict(format!(
            "record {record_id} does not belong to {project_id}#{chapter_number}"
        )));
    }

    sqlx::query(
        "UPDATE chapters SET state = 'history'
         WHERE project_id = $1 AND chapter_number = $2 AND state = 'current'
           AND record_id != $3",
    )
    .bind(project_id)
    .bind(i64::from(chapter_number))
    .bind(record_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE chapters SET state = 'current' WHERE record_id = $1")
        .bind(record_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn create_session(&self, project_id: Option<&str>) -> Result<Session, StorageError> {
        let session = Session::new(project_id.map(str::to_string));
        upsert_session(&self.pool, &session).await?;
        Ok(session)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        upsert_session(&self.pool, session).await
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), StorageError> {
        let mut session = self
            .load_session(session_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;
        session.push_turn(turn);
        upsert_session(&self.pool, &session).await
    }

    async fn evict_session(&self, session_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit_turn(&self, writes: TurnWrites) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for (project_id, item) in &writes.memory_adds {
            insert_item(&mut *tx, project_id, item).await?;
        }
        for (project_id, id, patch) in &writes.memory_updates {
            let row = sqlx::query("SELECT * FROM memory_items WHERE project_id = $1 AND id = $2")
                .bind(project_id)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                return Err(StorageError::NotFound {
                    entity: "memory item",
                    id: id.clone(),
                });
            };
            let mut item = item_from_row(&row)?;
            patch.clone().apply(&mut item);
            insert_item(&mut *tx, project_id, &item).await?;
        }
        for (project_id, id) in &writes.memory_deletes {
            sqlx::query("DELETE FROM memory_items WHERE project_id = $1 AND id = $2")
                .bind(project_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some((project_id, bundle)) = &writes.settings {
            save_settings_in_tx(&mut tx, project_id, bundle).await?;
        }
        for record in &writes.records {
            insert_record(&mut *tx, record).await?;
        }
        for (project_id, chapter_number, record_id) in &writes.promote_current {
            set_current_in_tx(&mut tx, project_id, *chapter_number, record_id).await?;
        }
        if let Some(session) = &writes.session {
            upsert_session(&mut *tx, session).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationMode;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        SqliteStore::new(pool).await.expect("schema should apply")
    }

    fn draft_record(project: &str, chapter: u32) -> GenerationRecord {
        let mut record = GenerationRecord::new(project, chapter, GenerationMode::Full, "fp");
        record.state = ChapterState::Draft;
        record.content = "rain fell on the neon".into();
        record.word_count = 5;
        record
    }

    #[tokio::test]
    async fn memory_item_roundtrip_with_embedding() {
        let store = store().await;
        let item = MemoryItem::new(MemoryLevel::Global, "magic exists")
            .with_metadata("order", 3_i64)
            .with_embedding(vec![0.25, -1.5, 3.0]);
        let id = store.add_item("p1", item).await.unwrap();

        let loaded = store.get_item("p1", &id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "magic exists");
        assert_eq!(loaded.embedding, Some(vec![0.25, -1.5, 3.0]));
        assert!(loaded.embedding_fresh());
        assert_eq!(loaded.order(), Some(3));
    }

    #[tokio::test]
    async fn update_item_applies_patch() {
        let store = store().await;
        let id = store
            .add_item("p1", MemoryItem::new(MemoryLevel::Style, "noir"))
            .await
            .unwrap();
        let updated = store
            .update_item("p1", &id, MemoryPatch::content("cozy"))
            .await
            .unwrap();
        assert_eq!(updated.content, "cozy");
        let reloaded = store.get_item("p1", &id).await.unwrap().unwrap();
        assert_eq!(reloaded.content, "cozy");
    }

    #[tokio::test]
    async fn record_roundtrip_and_current_promotion() {
        let store = store().await;
        let first = draft_record("p1", 4);
        let second = draft_record("p1", 4).with_parent(first.id.clone());
        store.add_record(&first).await.unwrap();
        store.add_record(&second).await.unwrap();

        store.set_current("p1", 4, &first.id).await.unwrap();
        store.set_current("p1", 4, &second.id).await.unwrap();

        let current = store.get_current("p1", 4).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.parent_id.as_deref(), Some(first.id.as_str()));

        let history = store.history("p1", 4).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history
                .iter()
                .filter(|r| r.state == ChapterState::Current)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = store().await;
        let session = store.create_session(Some("p1")).await.unwrap();
        store
            .append_turn(&session.session_id, Turn::user("hello"))
            .await
            .unwrap();
        store
            .append_turn(&session.session_id, Turn::assistant("hi"))
            .await
            .unwrap();

        let loaded = store
            .load_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(loaded.project_id.as_deref(), Some("p1"));

        assert!(store.evict_session(&session.session_id).await.unwrap());
        assert!(store
            .load_session(&session.session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn commit_turn_rolls_back_on_error() {
        let store = store().await;
        let mut writes = TurnWrites::new();
        writes
            .memory_adds
            .push(("p1".into(), MemoryItem::new(MemoryLevel::Plot, "summary")));
        // Promotion of a record that does not exist fails the transaction.
        writes
            .promote_current
            .push(("p1".into(), 1, "gen_missing".into()));

        assert!(store.commit_turn(writes).await.is_err());
        assert!(store.list_items("p1", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_turn_persists_full_turn() {
        let store = store().await;
        let record = draft_record("p1", 1);
        let session = Session::new(Some("p1".into()));

        let mut writes = TurnWrites::new();
        writes
            .memory_adds
            .push(("p1".into(), MemoryItem::new(MemoryLevel::Plot, "chapter one summary")));
        writes.records.push(record.clone());
        writes
            .promote_current
            .push(("p1".into(), 1, record.id.clone()));
        writes.session = Some(session.clone());

        store.commit_turn(writes).await.unwrap();

        assert_eq!(
            store.get_current("p1", 1).await.unwrap().unwrap().id,
            record.id
        );
        assert_eq!(store.list_items("p1", None, None).await.unwrap().len(), 1);
        assert!(store
            .load_session(&session.session_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn settings_bundle_roundtrip() {
        use crate::settings::{CharacterRole, PlotPoint, PlotPointKind};

        let store = store().await;
        let mut bundle = SettingsBundle::default();
        bundle.characters.push(
            crate::settings::CharacterProfile::new("Lin Feng", CharacterRole::Protagonist)
                .with_trait("ex-detective"),
        );
        bundle.world.genre = Some("cyberpunk".into());
        bundle.world.add_location("Shanghai");
        bundle
            .plot_points
            .push(PlotPoint::new(PlotPointKind::Inciting, "an AI goes missing"));
        bundle.themes.push("memory".into());
        bundle.style_hints.insert("tone".into(), "noir".into());

        store.save_settings("p1", &bundle).await.unwrap();
        let loaded = store.load_settings("p1").await.unwrap();
        assert_eq!(loaded.fingerprint(), bundle.fingerprint());

        // Fresh project loads an empty bundle.
        let empty = store.load_settings("p2").await.unwrap();
        assert!(empty.characters.is_empty());
    }

    #[tokio::test]
    async fn project_cascade_delete() {
        let store = store().await;
        let project = store.create_project("Neon Rain").await.unwrap();
        store
            .add_item(&project.id, MemoryItem::new(MemoryLevel::Global, "fact"))
            .await
            .unwrap();
        store
            .add_record(&draft_record(&project.id, 1))
            .await
            .unwrap();

        assert!(store.delete_project(&project.id).await.unwrap());
        assert!(store
            .list_items(&project.id, None, None)
            .await
            .unwrap()
            .is_empty());
        assert!(store.list_records(&project.id).await.unwrap().is_empty());
    }
}
