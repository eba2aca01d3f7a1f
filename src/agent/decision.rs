use crate::generation::GenerationMode;
use crate::intent::IntentKind;
use serde::{Deserialize, Serialize};

/// Why the engine chose to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationTrigger {
    ExplicitRequest,
    UserContinue,
    Readiness,
}

/// The silent creation decision: the user just chats, content appears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationDecision {
    pub should_create: bool,
    pub mode: GenerationMode,
    pub chapter_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<CreationTrigger>,
    pub reason: String,
}

impl CreationDecision {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            should_create: false,
            mode: GenerationMode::Full,
            chapter_number: 1,
            trigger: None,
            reason: reason.into(),
        }
    }
}

/// Everything the rule looks at for one turn.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub intent: IntentKind,
    pub message: &'a str,
    pub completeness: f64,
    pub consistency: f64,
    pub completion_threshold: f64,
    pub consistency_threshold: f64,
    /// Highest chapter number with any record.
    pub last_chapter: Option<u32>,
    /// Chapters that currently have a CURRENT record.
    pub current_chapters: &'a [u32],
}

const GENERATION_CUES: &[&str] = &[
    "write",
    "start writing",
    "begin the story",
    "go ahead",
    "rewrite",
    "expand",
    "generate",
    "开始写",
    "动笔",
    "写吧",
    "重写",
    "扩写",
];

const CONTINUE_CUES: &[&str] = &["continue", "next", "keep going", "继续", "接着", "下一章"];

/// The decision rule: generate when the intent is an explicit
/// generate/continue, or when the settings are ready, consistent, and the
/// last turn carries a generation cue. Consistency below the floor always
/// blocks.
#[must_use]
pub fn decide(inputs: &DecisionInputs<'_>) -> CreationDecision {
    let lower = inputs.message.to_lowercase();
    let has_cue = GENERATION_CUES.iter().any(|cue| lower.contains(cue));
    let has_continue_cue = CONTINUE_CUES.iter().any(|cue| lower.contains(cue));

    if inputs.consistency < inputs.consistency_threshold {
        return CreationDecision::no(format!(
            "consistency {:.2} below floor {:.2}; asking for clarification instead",
            inputs.consistency, inputs.consistency_threshold
        ));
    }

    let trigger = if inputs.intent == IntentKind::GenerateContent {
        Some(CreationTrigger::ExplicitRequest)
    } else if inputs.intent == IntentKind::ContinueContent {
        Some(CreationTrigger::UserContinue)
    } else if inputs.completeness >= inputs.completion_threshold && has_cue {
        Some(CreationTrigger::Readiness)
    } else {
        None
    };

    let Some(trigger) = trigger else {
        return CreationDecision::no(format!(
            "no generation signal (completeness {:.2}, cue: {has_cue})",
            inputs.completeness
        ));
    };

    let (mode, chapter_number) = select_mode(inputs, &lower, has_continue_cue);
    CreationDecision {
        should_create: true,
        mode,
        chapter_number,
        trigger: Some(trigger),
        reason: match trigger {
            CreationTrigger::ExplicitRequest => "explicit generation request".into(),
            CreationTrigger::UserContinue => "user asked to continue".into(),
            CreationTrigger::Readiness => format!(
                "settings ready ({:.2}) and the turn carries a generation cue",
                inputs.completeness
            ),
        },
    }
}

/// Mode choice: CONTINUE when a current chapter exists and the user said
/// next/continue; REWRITE when an existing chapter is targeted; EXPAND
/// when a paragraph locator is present; else FULL.
fn select_mode(
    inputs: &DecisionInputs<'_>,
    lower: &str,
    has_continue_cue: bool,
) -> (GenerationMode, u32) {
    let next_chapter = inputs.last_chapter.map_or(1, |last| last + 1);
    let target = parse_chapter_ref(lower);

    if (inputs.intent == IntentKind::ContinueContent || has_continue_cue)
        && !inputs.current_chapters.is_empty()
        && target.is_none()
    {
        return (GenerationMode::Continue, next_chapter);
    }

    if let Some(chapter) = target {
        let exists = inputs.current_chapters.contains(&chapter);
        if exists && parse_paragraph_ref(lower).is_some() {
            return (GenerationMode::Expand, chapter);
        }
        if exists {
            return (GenerationMode::Rewrite, chapter);
        }
        return (GenerationMode::Full, chapter);
    }

    (GenerationMode::Full, next_chapter)
}

/// "chapter 4" → 4. Also accepts "第4章".
#[must_use]
pub fn parse_chapter_ref(lower: &str) -> Option<u32> {
    if let Some(pos) = lower.find("chapter") {
        let rest = &lower[pos + "chapter".len()..];
        if let Some(number) = leading_number(rest) {
            return Some(number);
        }
    }
    if let Some(pos) = lower.find('第') {
        let rest = &lower[pos + '第'.len_utf8()..];
        if rest.contains('章') {
            return leading_number(rest);
        }
    }
    None
}

/// "paragraph 2" → 2.
#[must_use]
pub fn parse_paragraph_ref(lower: &str) -> Option<u32> {
    for marker in ["paragraph", "段"] {
        if let Some(pos) = lower.find(marker) {
            // "第2段" puts the number before the marker.
            if let Some(number) = leading_number(&lower[pos + marker.len()..]) {
                return Some(number);
            }
            if let Some(number) = trailing_number(&lower[..pos]) {
                return Some(number);
            }
        }
    }
    None
}

fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text
        .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '#')
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn trailing_number(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(intent: IntentKind, message: &'a str, currents: &'a [u32]) -> DecisionInputs<'a> {
        DecisionInputs {
            intent,
            message,
            completeness: 1.0,
            consistency: 1.0,
            completion_threshold: 0.7,
            consistency_threshold: 0.5,
            last_chapter: currents.iter().max().copied(),
            current_chapters: currents,
        }
    }

    #[test]
    fn cold_start_without_cue_does_not_create() {
        let mut i = inputs(
            IntentKind::CreateStory,
            "I want a 2077 Shanghai cyberpunk novel, protagonist Lin Feng, \
             ex-detective hunting a missing AI",
            &[],
        );
        i.completeness = 1.0;
        let decision = decide(&i);
        assert!(!decision.should_create, "{}", decision.reason);
    }

    #[test]
    fn explicit_write_creates_full_chapter_one() {
        let decision = decide(&inputs(IntentKind::GenerateContent, "write chapter 1", &[]));
        assert!(decision.should_create);
        assert_eq!(decision.mode, GenerationMode::Full);
        assert_eq!(decision.chapter_number, 1);
        assert_eq!(decision.trigger, Some(CreationTrigger::ExplicitRequest));
    }

    #[test]
    fn continue_after_chapter_one() {
        let decision = decide(&inputs(IntentKind::ContinueContent, "continue", &[1]));
        assert!(decision.should_create);
        assert_eq!(decision.mode, GenerationMode::Continue);
        assert_eq!(decision.chapter_number, 2);
        assert_eq!(decision.trigger, Some(CreationTrigger::UserContinue));
    }

    #[test]
    fn rewrite_targets_existing_chapter() {
        let decision = decide(&inputs(
            IntentKind::ModifyContent,
            "rewrite chapter 4 with a cliffhanger ending",
            &[1, 2, 3, 4],
        ));
        assert!(decision.should_create);
        assert_eq!(decision.mode, GenerationMode::Rewrite);
        assert_eq!(decision.chapter_number, 4);
        assert_eq!(decision.trigger, Some(CreationTrigger::Readiness));
    }

    #[test]
    fn paragraph_locator_selects_expand() {
        let decision = decide(&inputs(
            IntentKind::ModifyContent,
            "expand chapter 4 paragraph 2 with more sensory detail",
            &[1, 2, 3, 4],
        ));
        assert!(decision.should_create);
        assert_eq!(decision.mode, GenerationMode::Expand);
        assert_eq!(decision.chapter_number, 4);
    }

    #[test]
    fn low_consistency_blocks_even_explicit_requests() {
        let mut i = inputs(IntentKind::GenerateContent, "write chapter 1", &[]);
        i.consistency = 0.4;
        let decision = decide(&i);
        assert!(!decision.should_create);
        assert!(decision.reason.contains("consistency"));
    }

    #[test]
    fn incomplete_settings_need_explicit_intent() {
        let mut i = inputs(IntentKind::Chat, "please write something", &[]);
        i.completeness = 0.4;
        let decision = decide(&i);
        assert!(!decision.should_create);
    }

    #[test]
    fn ready_settings_plus_cue_create_without_explicit_intent() {
        let decision = decide(&inputs(IntentKind::Chat, "ok, go ahead", &[]));
        assert!(decision.should_create);
        assert_eq!(decision.trigger, Some(CreationTrigger::Readiness));
        assert_eq!(decision.chapter_number, 1);
    }

    #[test]
    fn explicit_write_of_unwritten_chapter_is_full() {
        let decision = decide(&inputs(IntentKind::GenerateContent, "write chapter 5", &[1, 2]));
        assert_eq!(decision.mode, GenerationMode::Full);
        assert_eq!(decision.chapter_number, 5);
    }

    #[test]
    fn chapter_ref_parsing() {
        assert_eq!(parse_chapter_ref("rewrite chapter 4 please"), Some(4));
        assert_eq!(parse_chapter_ref("chapter 12: the fall"), Some(12));
        assert_eq!(parse_chapter_ref("重写第3章"), Some(3));
        assert_eq!(parse_chapter_ref("no number here"), None);
    }

    #[test]
    fn paragraph_ref_parsing() {
        assert_eq!(parse_paragraph_ref("chapter 4 paragraph 2"), Some(2));
        assert_eq!(parse_paragraph_ref("第4章第2段"), Some(2));
        assert_eq!(parse_paragraph_ref("no locator"), None);
    }
}
