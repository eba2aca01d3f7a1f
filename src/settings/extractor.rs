use super::edits::{SettingEdit, WorldField};
use super::models::{CharacterRole, PlotPoint, PlotPointKind};

// Lexicons for the fast keyword stage. English plus the Chinese terms the
// assistant most often sees; anything subtler is left to the AI completer.

const GENRES: &[&str] = &[
    "cyberpunk",
    "steampunk",
    "science fiction",
    "sci-fi",
    "space opera",
    "fantasy",
    "urban fantasy",
    "wuxia",
    "xianxia",
    "romance",
    "mystery",
    "thriller",
    "horror",
    "dystopian",
    "historical",
    "noir",
    "科幻",
    "奇幻",
    "武侠",
    "仙侠",
    "悬疑",
    "恐怖",
    "言情",
];

const ROLE_CUES: &[(&str, CharacterRole)] = &[
    ("protagonist", CharacterRole::Protagonist),
    ("hero", CharacterRole::Protagonist),
    ("heroine", CharacterRole::Protagonist),
    ("antagonist", CharacterRole::Antagonist),
    ("villain", CharacterRole::Antagonist),
    ("sidekick", CharacterRole::Supporting),
    ("主角", CharacterRole::Protagonist),
    ("反派", CharacterRole::Antagonist),
    ("配角", CharacterRole::Supporting),
];

const CONFLICT_WORDS: &[&str] = &[
    "hunting", "hunts", "hunt", "chasing", "chase", "fighting", "fights", "fight", "war", "revenge",
    "murder", "missing", "kidnapped", "kidnap", "stolen", "steal", "betrayal", "betray",
    "escape", "rescue", "destroy", "invasion", "conspiracy", "investigate", "investigating",
    "mystery", "threat", "survive", "curse", "heist", "追杀", "复仇", "失踪", "阴谋", "战争",
];

const TONE_WORDS: &[&str] = &[
    "dark", "gritty", "noir", "lighthearted", "comedic", "melancholic", "hopeful", "bleak",
    "whimsical", "atmospheric", "阴郁", "轻松", "黑暗",
];

const NAME_CONNECTORS: &[&str] = &["named", "called", "is", "was", "the"];

const TRAIT_STOPPERS: &[&str] = &[
    "who", "that", "which", "and", "or", "but", "with", "in", "at", "on", "from", "to", "of",
];

const LOCATION_PREPOSITIONS: &[&str] = &["in", "at", "near", "from", "to"];

const CAPITALIZED_STOPWORDS: &[&str] = &[
    "The", "A", "An", "My", "Our", "We", "He", "She", "They", "It", "This", "That", "Chapter",
];

/// Stateless keyword extractor: derives setting edits from one user turn.
/// Conservative by design; gaps are the AI completer's job.
#[derive(Debug, Default)]
pub struct SettingExtractor;

impl SettingExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn extract(&self, text: &str) -> Vec<SettingEdit> {
        let mut edits = Vec::new();
        let lower = text.to_lowercase();

        self.extract_genre(&lower, &mut edits);
        self.extract_era(text, &mut edits);

        let sentences = split_sentences(text);
        let mut character_names: Vec<String> = Vec::new();

        for sentence in &sentences {
            let tokens = tokenize(sentence);
            self.extract_characters(&tokens, &mut character_names, &mut edits);
        }

        for sentence in &sentences {
            let tokens = tokenize(sentence);
            self.extract_locations(&tokens, &character_names, &mut edits);
            self.extract_conflict(sentence, &tokens, &character_names, &mut edits);
        }

        self.extract_negated_rules(&lower, &mut edits);
        self.extract_style(&lower, &mut edits);

        edits
    }

    fn extract_genre(&self, lower: &str, edits: &mut Vec<SettingEdit>) {
        for genre in GENRES {
            if lower.contains(genre) {
                edits.push(SettingEdit::UpsertWorldField {
                    field: WorldField::Genre,
                    value: (*genre).to_string(),
                    ai_generated: false,
                });
                return;
            }
        }
    }

    fn extract_era(&self, text: &str, edits: &mut Vec<SettingEdit>) {
        for token in text.split(|c: char| !c.is_ascii_digit()) {
            if token.len() == 4 {
                if let Ok(year) = token.parse::<u32>() {
                    if (800..=3500).contains(&year) {
                        edits.push(SettingEdit::UpsertWorldField {
                            field: WorldField::Era,
                            value: token.to_string(),
                            ai_generated: false,
                        });
                        return;
                    }
                }
            }
        }
    }

    fn extract_characters(
        &self,
        tokens: &[Token],
        known_names: &mut Vec<String>,
        edits: &mut Vec<SettingEdit>,
    ) {
        let mut i = 0;
        while i < tokens.len() {
            let cue = ROLE_CUES
                .iter()
                .find(|(cue, _)| tokens[i].lower == *cue)
                .map(|(_, role)| *role);

            let Some(role) = cue else {
                i += 1;
                continue;
            };

            // Skip connectors, then take up to three capitalized tokens.
            let mut j = i + 1;
            while j < tokens.len() && NAME_CONNECTORS.contains(&tokens[j].lower.as_str()) {
                j += 1;
            }
            let name_start = j;
            while j < tokens.len() && j - name_start < 3 && tokens[j].is_name_part() {
                j += 1;
            }

            if j > name_start {
                let name = tokens[name_start..j]
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");

                edits.push(SettingEdit::UpsertCharacter {
                    name: name.clone(),
                    role: Some(role),
                    background: None,
                    ai_generated: false,
                });

                // Appositive traits: "Lin Feng, ex-detective hunting…" keeps
                // "ex-detective" and stops at the gerund.
                if tokens[j - 1].followed_by_comma {
                    let mut descriptors = Vec::new();
                    let mut k = j;
                    while k < tokens.len() && descriptors.len() < 4 {
                        let token = &tokens[k];
                        if token.lower.ends_with("ing")
                            || TRAIT_STOPPERS.contains(&token.lower.as_str())
                            || token.is_name_part()
                        {
                            break;
                        }
                        if token.lower != "a" && token.lower != "an" {
                            descriptors.push(token.text.clone());
                        }
                        if token.followed_by_comma {
                            k += 1;
                            break;
                        }
                        k += 1;
                    }
                    if !descriptors.is_empty() {
                        edits.push(SettingEdit::AddTrait {
                            character: name.clone(),
                            value: descriptors.join(" "),
                        });
                    }
                }

                if !known_names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                    known_names.push(name);
                }
                i = j;
            } else {
                i += 1;
            }
        }
    }

    fn extract_locations(
        &self,
        tokens: &[Token],
        character_names: &[String],
        edits: &mut Vec<SettingEdit>,
    ) {
        let is_character_word = |word: &str| {
            character_names
                .iter()
                .any(|name| name.split_whitespace().any(|part| part == word))
        };

        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];

            // Multi-word place after a preposition: "set in Night City".
            if LOCATION_PREPOSITIONS.contains(&token.lower.as_str()) {
                let start = i + 1;
                let mut j = start;
                while j < tokens.len() && j - start < 3 && tokens[j].is_name_part() {
                    j += 1;
                }
                if j > start {
                    let place = tokens[start..j]
                        .iter()
                        .map(|t| t.text.as_str())
                        .collect::<Vec<_>>()
                        .join(" ");
                    if !place.split_whitespace().any(is_character_word) {
                        edits.push(SettingEdit::AddLocation { name: place });
                    }
                    i = j;
                    continue;
                }
            }

            // Lone capitalized word mid-sentence: location candidate.
            if token.is_name_part()
                && !token.sentence_initial
                && !is_character_word(&token.text)
                && !CAPITALIZED_STOPWORDS.contains(&token.text.as_str())
                && (i + 1 >= tokens.len() || !tokens[i + 1].is_name_part())
                && (i == 0 || !tokens[i - 1].is_name_part())
            {
                edits.push(SettingEdit::AddLocation {
                    name: token.text.clone(),
                });
            }

            i += 1;
        }
    }

    fn extract_conflict(
        &self,
        sentence: &str,
        tokens: &[Token],
        character_names: &[String],
        edits: &mut Vec<SettingEdit>,
    ) {
        let hit = tokens
            .iter()
            .any(|t| CONFLICT_WORDS.contains(&t.lower.as_str()))
            || CONFLICT_WORDS
                .iter()
                .any(|w| !w.is_ascii() && sentence.contains(w));
        if !hit {
            return;
        }

        let summary = sentence.trim().trim_end_matches(['.', '!', '?']);
        let summary = if summary.chars().count() > 200 {
            summary.chars().take(200).collect::<String>()
        } else {
            summary.to_string()
        };

        let mut point = PlotPoint::new(PlotPointKind::Inciting, summary);
        for name in character_names {
            if sentence.contains(name.as_str()) {
                point.involved_characters.insert(name.clone());
            }
        }
        edits.push(SettingEdit::AddPlotPoint { point });
    }

    fn extract_negated_rules(&self, lower: &str, edits: &mut Vec<SettingEdit>) {
        for pattern in ["there's no ", "there is no ", "there are no ", "without any ", "no more "] {
            if let Some(pos) = lower.find(pattern) {
                let rest = &lower[pos + pattern.len()..];
                let mut subject: Vec<String> = Vec::new();
                for raw in rest.split_whitespace().take(3) {
                    let trimmed: String = raw
                        .trim_matches(|c: char| !c.is_alphanumeric())
                        .to_string();
                    if trimmed.is_empty()
                        || trimmed == "at"
                        || TRAIT_STOPPERS.contains(&trimmed.as_str())
                    {
                        break;
                    }
                    let clause_end = raw.len() != trimmed.len();
                    subject.push(trimmed);
                    if clause_end {
                        break;
                    }
                }
                if !subject.is_empty() {
                    edits.push(SettingEdit::AddWorldRule {
                        rule: format!("no {}", subject.join(" ")),
                    });
                }
            }
        }
    }

    fn extract_style(&self, lower: &str, edits: &mut Vec<SettingEdit>) {
        for tone in TONE_WORDS {
            if lower.contains(tone) {
                edits.push(SettingEdit::SetStyle {
                    aspect: "tone".into(),
                    value: (*tone).to_string(),
                });
                break;
            }
        }
        for (marker, value) in [
            ("first person", "first person"),
            ("third person", "third person"),
            ("第一人称", "first person"),
            ("第三人称", "third person"),
        ] {
            if lower.contains(marker) {
                edits.push(SettingEdit::SetStyle {
                    aspect: "pov".into(),
                    value: value.into(),
                });
                break;
            }
        }
        for (marker, value) in [("fast-paced", "fast"), ("slow burn", "slow"), ("slow-burn", "slow")]
        {
            if lower.contains(marker) {
                edits.push(SettingEdit::SetStyle {
                    aspect: "pacing".into(),
                    value: value.into(),
                });
                break;
            }
        }
    }
}

// ─── Sentence / token scanning ───────────────────────────────────────────────

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

#[derive(Debug)]
struct Token {
    text: String,
    lower: String,
    followed_by_comma: bool,
    sentence_initial: bool,
}

impl Token {
    /// A plausible proper-noun component: leading uppercase, at least one
    /// following lowercase letter (filters acronyms like "AI").
    fn is_name_part(&self) -> bool {
        let mut chars = self.text.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !first.is_uppercase() {
            return false;
        }
        let rest: Vec<char> = chars.collect();
        !rest.is_empty() && rest.iter().all(|c| c.is_lowercase() || *c == '-')
    }
}

fn tokenize(sentence: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (i, raw) in sentence.split_whitespace().enumerate() {
        let followed_by_comma = raw.ends_with(',');
        let text: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
            .to_string();
        if text.is_empty() {
            continue;
        }
        tokens.push(Token {
            lower: text.to_lowercase(),
            text,
            followed_by_comma,
            sentence_initial: i == 0,
        });
    }
    tokens
}
