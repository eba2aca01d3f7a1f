use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the generator is asked to produce a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// New chapter from the outline.
    Full,
    /// Next chapter following the previous one.
    Continue,
    /// Flesh out a passage of an existing chapter.
    Expand,
    /// Replace an existing chapter under a new constraint.
    Rewrite,
    /// Chapter summary list, no prose.
    Outline,
}

impl GenerationMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Continue => "continue",
            Self::Expand => "expand",
            Self::Rewrite => "rewrite",
            Self::Outline => "outline",
        }
    }

    /// Whether the mode seeds the prompt with previous content.
    #[must_use]
    pub const fn needs_previous_content(self) -> bool {
        matches!(self, Self::Continue | Self::Expand | Self::Rewrite)
    }
}

impl std::str::FromStr for GenerationMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "continue" => Ok(Self::Continue),
            "expand" => Ok(Self::Expand),
            "rewrite" => Ok(Self::Rewrite),
            "outline" => Ok(Self::Outline),
            other => anyhow::bail!("invalid generation mode: {other}"),
        }
    }
}

/// Lifecycle of one generation record.
///
/// ```text
/// PENDING --generate--> GENERATING --success--> DRAFT
///                                  --fail-->    FAILED
/// DRAFT   --accept-->  CURRENT (others become HISTORY)
/// DRAFT   --rewrite--> GENERATING (new record, parent = prior)
/// CURRENT --delete-->  HISTORY
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    Pending,
    Generating,
    Draft,
    Current,
    History,
    Failed,
}

impl ChapterState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Draft => "draft",
            Self::Current => "current",
            Self::History => "history",
            Self::Failed => "failed",
        }
    }

    /// Legal transitions of the lifecycle diagram.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Generating)
                | (Self::Generating, Self::Draft | Self::Failed)
                | (Self::Draft, Self::Current)
                | (Self::Current, Self::History)
        )
    }
}

impl std::str::FromStr for ChapterState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "draft" => Ok(Self::Draft),
            "current" => Ok(Self::Current),
            "history" => Ok(Self::History),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("invalid chapter state: {other}"),
        }
    }
}

/// One produced chapter (or outline). Many records may exist per
/// `(project_id, chapter_number)`; at most one is CURRENT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub project_id: String,
    pub chapter_number: u32,
    pub mode: GenerationMode,
    pub state: ChapterState,
    pub content: String,
    pub word_count: u32,
    /// Prior record this one was rewritten from, forming a DAG by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Fingerprint of the canonicalized bundle the prompt was built from.
    pub settings_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn new(
        project_id: impl Into<String>,
        chapter_number: u32,
        mode: GenerationMode,
        settings_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("gen_{}", uuid::Uuid::new_v4()),
            project_id: project_id.into(),
            chapter_number,
            mode,
            state: ChapterState::Pending,
            content: String::new(),
            word_count: 0,
            parent_id: None,
            settings_fingerprint: settings_fingerprint.into(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Word counting across scripts: CJK graphemes count one apiece, runs of
/// Latin text count whitespace-separated words.
#[must_use]
pub fn count_words(text: &str) -> u32 {
    let mut count: u32 = 0;
    let mut in_word = false;
    for c in text.chars() {
        if crate::llm::is_cjk(c) {
            if in_word {
                count += 1;
                in_word = false;
            }
            count += 1;
        } else if c.is_whitespace() {
            if in_word {
                count += 1;
                in_word = false;
            }
        } else {
            in_word = true;
        }
    }
    if in_word {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use ChapterState::{Current, Draft, Failed, Generating, History, Pending};
        assert!(Pending.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Draft));
        assert!(Generating.can_transition_to(Failed));
        assert!(Draft.can_transition_to(Current));
        assert!(Current.can_transition_to(History));

        assert!(!Pending.can_transition_to(Current));
        assert!(!History.can_transition_to(Current));
        assert!(!Failed.can_transition_to(Draft));
    }

    #[test]
    fn latin_word_count() {
        assert_eq!(count_words("the rain would not stop"), 5);
        assert_eq!(count_words("  spaced   out  "), 2);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn cjk_counts_per_character() {
        assert_eq!(count_words("雨一直下"), 4);
    }

    #[test]
    fn mixed_text_counts_both() {
        // "Lin Feng" = 2 words, "在" + "上海" = 3 chars.
        assert_eq!(count_words("Lin Feng 在上海"), 5);
        // No space between latin word and CJK run.
        assert_eq!(count_words("AI觉醒了"), 4);
    }

    #[test]
    fn record_constructor_defaults() {
        let record = GenerationRecord::new("proj-1", 3, GenerationMode::Full, "fp");
        assert!(record.id.starts_with("gen_"));
        assert_eq!(record.state, ChapterState::Pending);
        assert_eq!(record.word_count, 0);
        assert!(record.parent_id.is_none());
    }

    #[test]
    fn modes_needing_previous_content() {
        assert!(GenerationMode::Continue.needs_previous_content());
        assert!(GenerationMode::Rewrite.needs_previous_content());
        assert!(GenerationMode::Expand.needs_previous_content());
        assert!(!GenerationMode::Full.needs_previous_content());
        assert!(!GenerationMode::Outline.needs_previous_content());
    }

    #[test]
    fn mode_and_state_round_trip_strings() {
        for mode in [
            GenerationMode::Full,
            GenerationMode::Continue,
            GenerationMode::Expand,
            GenerationMode::Rewrite,
            GenerationMode::Outline,
        ] {
            assert_eq!(mode.as_str().parse::<GenerationMode>().unwrap(), mode);
        }
        for state in [
            ChapterState::Pending,
            ChapterState::Generating,
            ChapterState::Draft,
            ChapterState::Current,
            ChapterState::History,
            ChapterState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ChapterState>().unwrap(), state);
        }
    }
}
