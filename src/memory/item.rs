use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// The five retention tiers of story memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    /// World and theme facts. Unbounded, rarely updated.
    Global,
    /// One logical item per character; updates merge.
    Character,
    /// Plot points, ordered, appended per chapter summary.
    Plot,
    /// Recent chapters verbatim + recent dialogue. Ring-buffered.
    Context,
    /// Tone / POV / pacing. Singleton per aspect.
    Style,
}

impl MemoryLevel {
    pub const ALL: [Self; 5] = [
        Self::Global,
        Self::Character,
        Self::Plot,
        Self::Context,
        Self::Style,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Character => "character",
            Self::Plot => "plot",
            Self::Context => "context",
            Self::Style => "style",
        }
    }
}

impl std::str::FromStr for MemoryLevel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "character" => Ok(Self::Character),
            "plot" => Ok(Self::Plot),
            "context" => Ok(Self::Context),
            "style" => Ok(Self::Style),
            other => anyhow::bail!("invalid memory level: {other}"),
        }
    }
}

impl std::fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar metadata value. Keeps items serializable without arbitrary JSON
/// trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl MetadataValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Metadata key carrying the CONTEXT turn index.
pub const META_ORDER: &str = "order";
/// Metadata key carrying the STYLE aspect name.
pub const META_ASPECT: &str = "aspect";
/// Metadata key carrying the character name for CHARACTER items.
pub const META_CHARACTER: &str = "character";
/// Metadata key carrying the chapter number for PLOT/CONTEXT items.
pub const META_CHAPTER: &str = "chapter";

/// A single memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub level: MemoryLevel,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// SHA-256 of the content the embedding was computed from. Detects
    /// drift between `content` and `embedding`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    pub fn new(level: MemoryLevel, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}_{}", level.as_str(), uuid::Uuid::new_v4()),
            level,
            content: content.into(),
            metadata: BTreeMap::new(),
            embedding: None,
            embedded_content_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an embedding computed from the current content, recording the
    /// content hash it corresponds to.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedded_content_hash = Some(content_hash(&self.content));
        self.embedding = Some(embedding);
        self
    }

    /// CONTEXT turn index, when present.
    #[must_use]
    pub fn order(&self) -> Option<i64> {
        self.metadata.get(META_ORDER).and_then(MetadataValue::as_int)
    }

    /// STYLE aspect, when present.
    #[must_use]
    pub fn aspect(&self) -> Option<&str> {
        self.metadata.get(META_ASPECT).and_then(MetadataValue::as_str)
    }

    /// Character name key, when present.
    #[must_use]
    pub fn character_name(&self) -> Option<&str> {
        self.metadata
            .get(META_CHARACTER)
            .and_then(MetadataValue::as_str)
    }

    /// Whether the stored embedding still matches the current content.
    #[must_use]
    pub fn embedding_fresh(&self) -> bool {
        match (&self.embedding, &self.embedded_content_hash) {
            (None, _) => true,
            (Some(_), Some(hash)) => *hash == content_hash(&self.content),
            (Some(_), None) => false,
        }
    }
}

/// Partial update applied through `MemoryRepository::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Keys merged over the existing metadata map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
    /// New embedding (paired with the content it was computed from).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryPatch {
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Apply onto an item, bumping `updated_at`. A content change without a
    /// fresh embedding leaves the stored hash disagreeing with the content;
    /// `embedding_fresh` reports that staleness.
    pub fn apply(self, item: &mut MemoryItem) {
        if let Some(content) = self.content {
            item.content = content;
        }
        for (key, value) in self.metadata {
            item.metadata.insert(key, value);
        }
        if let Some(embedding) = self.embedding {
            item.embedded_content_hash = Some(content_hash(&item.content));
            item.embedding = Some(embedding);
        }
        item.updated_at = Utc::now();
    }
}

/// SHA-256 hex digest of item content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_gets_level_prefixed_id() {
        let item = MemoryItem::new(MemoryLevel::Plot, "the heist begins");
        assert!(item.id.starts_with("plot_"));
        assert_eq!(item.level, MemoryLevel::Plot);
    }

    #[test]
    fn metadata_accessors() {
        let item = MemoryItem::new(MemoryLevel::Context, "dialogue")
            .with_metadata(META_ORDER, 7_i64)
            .with_metadata(META_CHAPTER, 2_i64);
        assert_eq!(item.order(), Some(7));
        assert_eq!(item.aspect(), None);
    }

    #[test]
    fn embedding_freshness_tracks_content() {
        let mut item =
            MemoryItem::new(MemoryLevel::Global, "magic exists").with_embedding(vec![0.1, 0.2]);
        assert!(item.embedding_fresh());

        MemoryPatch::content("magic is gone").apply(&mut item);
        assert!(!item.embedding_fresh());

        MemoryPatch::default()
            .with_embedding(vec![0.3, 0.4])
            .apply(&mut item);
        assert!(item.embedding_fresh());
    }

    #[test]
    fn patch_merges_metadata_and_bumps_updated_at() {
        let mut item = MemoryItem::new(MemoryLevel::Style, "first person")
            .with_metadata(META_ASPECT, "pov");
        let before = item.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));

        MemoryPatch::content("third person limited")
            .with_metadata("note", "user change")
            .apply(&mut item);

        assert_eq!(item.content, "third person limited");
        assert_eq!(item.aspect(), Some("pov"));
        assert!(item.updated_at > before);
    }

    #[test]
    fn content_hash_is_stable_and_distinct() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn level_parses_both_ways() {
        for level in MemoryLevel::ALL {
            let parsed: MemoryLevel = level.as_str().parse().unwrap();
            assert_eq!(parsed, level);
        }
        assert!("cosmic".parse::<MemoryLevel>().is_err());
    }

    #[test]
    fn metadata_value_serializes_untagged() {
        let json = serde_json::to_string(&MetadataValue::Int(5)).unwrap();
        assert_eq!(json, "5");
        let json = serde_json::to_string(&MetadataValue::Str("x".into())).unwrap();
        assert_eq!(json, "\"x\"");
    }
}
