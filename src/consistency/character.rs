use super::report::{ConsistencyIssue, IssueKind, Locus, Severity};
use crate::settings::SettingsBundle;

/// Trait pairs treated as reversals when one replaces the other without an
/// explanatory note.
const TRAIT_OPPOSITES: &[(&str, &str)] = &[
    ("brave", "cowardly"),
    ("kind", "cruel"),
    ("honest", "deceitful"),
    ("calm", "hot-tempered"),
    ("loyal", "treacherous"),
    ("cautious", "reckless"),
    ("optimistic", "cynical"),
];

/// Tracks character facts across settings changes and generated chapters.
#[derive(Debug, Default)]
pub struct CharacterTracker;

impl CharacterTracker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Compare a proposed bundle against the prior one: role flips are
    /// errors, trait reversals without a reason are warnings.
    #[must_use]
    pub fn check_change(
        &self,
        previous: &SettingsBundle,
        proposed: &SettingsBundle,
    ) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();

        for character in &proposed.characters {
            let Some(prior) = previous.character(&character.name) else {
                continue;
            };

            if prior.role != character.role {
                issues.push(ConsistencyIssue::new(
                    IssueKind::RoleContradiction,
                    Severity::Error,
                    Locus::Character(character.name.clone()),
                    format!(
                        "{} was {} and is now claimed as {}",
                        character.name,
                        prior.role.as_str(),
                        character.role.as_str()
                    ),
                ));
            }

            for (a, b) in TRAIT_OPPOSITES {
                let had_a = prior.traits.iter().any(|t| t.eq_ignore_ascii_case(a));
                let gains_b = character.traits.iter().any(|t| t.eq_ignore_ascii_case(b));
                let had_b = prior.traits.iter().any(|t| t.eq_ignore_ascii_case(b));
                let gains_a = character.traits.iter().any(|t| t.eq_ignore_ascii_case(a));
                if (had_a && gains_b && !had_b) || (had_b && gains_a && !had_a) {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::TraitReversal,
                        Severity::Warn,
                        Locus::Character(character.name.clone()),
                        format!(
                            "{} gains a trait opposing an established one ({a} vs {b}) with no stated reason",
                            character.name
                        ),
                    ));
                }
            }
        }

        issues.extend(self.check_relationship_symmetry(proposed));
        issues
    }

    /// Relationship claims should be mutual: A→friend(B) expects B to carry
    /// some relation back to A.
    #[must_use]
    pub fn check_relationship_symmetry(&self, bundle: &SettingsBundle) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();
        for character in &bundle.characters {
            for other_name in character.relationships.keys() {
                let Some(other) = bundle.character(other_name) else {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::UnknownName,
                        Severity::Warn,
                        Locus::Character(character.name.clone()),
                        format!(
                            "{} claims a relationship with unknown character {other_name}",
                            character.name
                        ),
                    ));
                    continue;
                };
                let reciprocal = other
                    .relationships
                    .keys()
                    .any(|name| name.eq_ignore_ascii_case(&character.name));
                if !reciprocal {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::AsymmetricRelationship,
                        Severity::Warn,
                        Locus::Character(character.name.clone()),
                        format!(
                            "{} → {other_name} has no relation back from {other_name}",
                            character.name
                        ),
                    ));
                }
            }
        }
        issues
    }

    /// Scan generated prose for names that look like characters but match
    /// nobody in the bundle. Single-token partial matches of known names
    /// ("Lin" for "Lin Feng") pass.
    #[must_use]
    pub fn check_text(&self, bundle: &SettingsBundle, text: &str) -> Vec<ConsistencyIssue> {
        let known: Vec<&str> = bundle.character_names();
        let known_parts: Vec<String> = known
            .iter()
            .flat_map(|name| name.split_whitespace())
            .map(str::to_lowercase)
            .collect();
        let known_locations: Vec<String> = bundle
            .world
            .locations
            .iter()
            .map(|l| l.to_lowercase())
            .collect();

        let mut issues = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for run in capitalized_runs(text) {
            // Only multi-word runs look like full character names.
            if run.split_whitespace().count() < 2 {
                continue;
            }
            let run_lower = run.to_lowercase();
            if known.iter().any(|name| name.eq_ignore_ascii_case(&run)) {
                continue;
            }
            if known_locations.iter().any(|l| *l == run_lower) {
                continue;
            }
            // A run entirely made of known name parts is a stylistic
            // re-combination, not a new person.
            if run_lower
                .split_whitespace()
                .all(|part| known_parts.iter().any(|p| p == part))
            {
                continue;
            }
            if seen.contains(&run_lower) {
                continue;
            }
            seen.push(run_lower);
            issues.push(ConsistencyIssue::new(
                IssueKind::UnknownName,
                Severity::Warn,
                Locus::Character(run.clone()),
                format!("\"{run}\" appears in the chapter but matches no known character"),
            ));
        }

        issues
    }
}

/// Maximal runs of capitalized words ("Lin Feng", "Doctor Wen"), skipping
/// sentence-initial single words and acronyms.
fn capitalized_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    for sentence in text.split(['.', '!', '?', '\n', '。', '！', '？']) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let mut i = 0;
        while i < words.len() {
            let cleaned = clean_word(words[i]);
            if i != 0 && looks_like_name_part(&cleaned) {
                let mut run = vec![cleaned];
                let mut j = i + 1;
                while j < words.len() {
                    let next = clean_word(words[j]);
                    if looks_like_name_part(&next) {
                        run.push(next);
                        j += 1;
                    } else {
                        break;
                    }
                }
                runs.push(run.join(" "));
                i = j;
            } else {
                i += 1;
            }
        }
    }
    runs
}

fn clean_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
        .to_string()
}

fn looks_like_name_part(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_uppercase() {
        return false;
    }
    let rest: Vec<char> = chars.collect();
    !rest.is_empty() && rest.iter().all(|c| c.is_lowercase() || *c == '-')
}
