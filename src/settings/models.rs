use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

// ─── Characters ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Protagonist,
    Antagonist,
    Supporting,
    Minor,
}

impl CharacterRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protagonist => "protagonist",
            Self::Antagonist => "antagonist",
            Self::Supporting => "supporting",
            Self::Minor => "minor",
        }
    }
}

/// A character profile. Characters reference each other by name (string
/// key), never by pointer, so the bundle stays a pure tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub role: CharacterRole,
    #[serde(default)]
    pub traits: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    /// Other-character name → relation label.
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    #[serde(default)]
    pub ai_generated: bool,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>, role: CharacterRole) -> Self {
        Self {
            name: name.into(),
            role,
            traits: BTreeSet::new(),
            background: None,
            relationships: BTreeMap::new(),
            ai_generated: false,
        }
    }

    #[must_use]
    pub fn with_trait(mut self, value: impl Into<String>) -> Self {
        self.traits.insert(value.into());
        self
    }

    #[must_use]
    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    #[must_use]
    pub fn with_relationship(
        mut self,
        other: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        self.relationships.insert(other.into(), relation.into());
        self
    }

    /// Merge another profile for the same name: present fields win, sets
    /// union. The name never changes through a merge.
    pub fn merge(&mut self, other: &Self) {
        // A concrete role claim overrides the Minor placeholder only;
        // established roles change through explicit edits, not merges.
        if self.role == CharacterRole::Minor && other.role != CharacterRole::Minor {
            self.role = other.role;
        }
        self.traits.extend(other.traits.iter().cloned());
        if self.background.is_none() {
            self.background.clone_from(&other.background);
        }
        for (name, relation) in &other.relationships {
            self.relationships
                .entry(name.clone())
                .or_insert_with(|| relation.clone());
        }
        self.ai_generated = self.ai_generated && other.ai_generated;
    }
}

// ─── World ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub era: Option<String>,
    /// Ordered, de-duplicated.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Positive assertions about how the world works.
    #[serde(default)]
    pub rules: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technology_level: Option<String>,
    #[serde(default)]
    pub ai_generated: bool,
}

impl WorldSetting {
    /// Append a location if unseen, preserving first-mention order.
    pub fn add_location(&mut self, location: impl Into<String>) {
        let location = location.into();
        if !self
            .locations
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&location))
        {
            self.locations.push(location);
        }
    }
}

// ─── Plot ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotPointKind {
    Setup,
    Inciting,
    Rising,
    Climax,
    Resolution,
    Subplot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_hint: Option<u32>,
    pub summary: String,
    pub kind: PlotPointKind,
    #[serde(default)]
    pub involved_characters: BTreeSet<String>,
    #[serde(default)]
    pub resolved: bool,
}

impl PlotPoint {
    pub fn new(kind: PlotPointKind, summary: impl Into<String>) -> Self {
        Self {
            chapter_hint: None,
            summary: summary.into(),
            kind,
            involved_characters: BTreeSet::new(),
            resolved: false,
        }
    }

    #[must_use]
    pub fn with_chapter(mut self, chapter: u32) -> Self {
        self.chapter_hint = Some(chapter);
        self
    }

    #[must_use]
    pub fn involving(mut self, name: impl Into<String>) -> Self {
        self.involved_characters.insert(name.into());
        self
    }
}

// ─── Bundle ──────────────────────────────────────────────────────────────────

/// The authoritative project-level state. All generation reads from an
/// immutable snapshot of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsBundle {
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub world: WorldSetting,
    #[serde(default)]
    pub plot_points: Vec<PlotPoint>,
    #[serde(default)]
    pub themes: Vec<String>,
    /// Aspect (tone, pacing, pov, tense, language…) → value.
    #[serde(default)]
    pub style_hints: BTreeMap<String, String>,
}

impl SettingsBundle {
    #[must_use]
    pub fn character(&self, name: &str) -> Option<&CharacterProfile> {
        self.characters
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn character_mut(&mut self, name: &str) -> Option<&mut CharacterProfile> {
        self.characters
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn protagonist(&self) -> Option<&CharacterProfile> {
        self.characters
            .iter()
            .find(|c| c.role == CharacterRole::Protagonist)
    }

    #[must_use]
    pub fn character_names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn has_unresolved_conflict(&self) -> bool {
        self.plot_points.iter().any(|p| !p.resolved)
    }

    /// Clone with order-independent collections normalized, so two bundles
    /// built in different insertion orders canonicalize identically.
    /// Location and plot order are meaningful and survive untouched.
    #[must_use]
    pub fn canonicalized(&self) -> Self {
        let mut canonical = self.clone();
        canonical
            .characters
            .sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        let mut themes = canonical.themes.clone();
        themes.sort();
        themes.dedup();
        canonical.themes = themes;
        canonical
    }

    /// Stable hash over the canonicalized bundle. Generation records carry
    /// it to detect settings drift on later reads.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = self.canonicalized();
        let json = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}
