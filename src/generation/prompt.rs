use super::record::GenerationMode;
use crate::llm::{estimate_tokens, tail_within_tokens, ChatMessage};
use crate::settings::{CharacterProfile, CharacterRole, SettingsBundle};

/// World block cap as a fraction of the prompt budget.
const WORLD_SHARE: f64 = 0.15;
/// Continuation seed cap in tokens.
const SEED_TOKEN_CAP: u32 = 800;

/// Everything the composer needs for one chapter prompt. Composition is
/// pure: same inputs, same messages.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub mode: GenerationMode,
    pub bundle: &'a SettingsBundle,
    pub memory_context: &'a str,
    pub chapter_number: u32,
    /// Target length in words.
    pub target_length: u32,
    pub constraints: &'a [String],
    pub previous_content: Option<&'a str>,
}

/// Deterministic prompt composition: system block, world block (capped),
/// character block, memory block, task block, continuation seed.
#[must_use]
pub fn compose(inputs: &PromptInputs<'_>, prompt_budget: u32) -> Vec<ChatMessage> {
    let system = system_block(inputs.bundle);

    let mut user = String::new();

    let world = world_block(inputs.bundle);
    if !world.is_empty() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let world_cap = (f64::from(prompt_budget) * WORLD_SHARE) as u32;
        user.push_str("# World\n");
        user.push_str(&clip_to_tokens(&world, world_cap.max(1)));
        user.push_str("\n\n");
    }

    let characters = character_block(inputs.bundle, inputs.chapter_number);
    if !characters.is_empty() {
        user.push_str("# Characters\n");
        user.push_str(&characters);
        user.push_str("\n\n");
    }

    if !inputs.memory_context.is_empty() {
        user.push_str("# Story memory\n");
        user.push_str(inputs.memory_context);
        user.push_str("\n\n");
    }

    user.push_str("# Task\n");
    user.push_str(&task_block(inputs));

    if let Some(previous) = inputs.previous_content {
        if inputs.mode.needs_previous_content() {
            user.push_str("\n\n# Preceding text\n");
            user.push_str(tail_within_tokens(previous, SEED_TOKEN_CAP));
        }
    }

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn system_block(bundle: &SettingsBundle) -> String {
    let mut block = String::from(
        "You are a professional long-form fiction author. Write vivid, \
         coherent prose that honors every established fact of the story.",
    );

    if !bundle.style_hints.is_empty() {
        block.push_str("\n\nStyle:");
        for (aspect, value) in &bundle.style_hints {
            block.push_str(&format!("\n- {aspect}: {value}"));
        }
    }

    for aspect in ["pov", "tense", "language"] {
        if let Some(value) = bundle.style_hints.get(aspect) {
            block.push_str(&format!(
                "\nHard constraint: keep the {aspect} strictly {value}."
            ));
        }
    }

    block
}

fn world_block(bundle: &SettingsBundle) -> String {
    let world = &bundle.world;
    let mut lines = Vec::new();
    if let Some(genre) = &world.genre {
        lines.push(format!("Genre: {genre}"));
    }
    if let Some(era) = &world.era {
        lines.push(format!("Era: {era}"));
    }
    if !world.locations.is_empty() {
        lines.push(format!("Locations: {}", world.locations.join(", ")));
    }
    if let Some(tech) = &world.technology_level {
        lines.push(format!("Technology: {tech}"));
    }
    for rule in &world.rules {
        lines.push(format!("Rule: {rule}"));
    }
    if !bundle.themes.is_empty() {
        lines.push(format!("Themes: {}", bundle.themes.join(", ")));
    }
    lines.join("\n")
}

/// Characters expected in this chapter: anyone a plot point pins to the
/// chapter, else the principals.
fn character_block(bundle: &SettingsBundle, chapter_number: u32) -> String {
    let pinned: Vec<&CharacterProfile> = bundle
        .plot_points
        .iter()
        .filter(|point| point.chapter_hint == Some(chapter_number))
        .flat_map(|point| point.involved_characters.iter())
        .filter_map(|name| bundle.character(name))
        .collect();

    let selected: Vec<&CharacterProfile> = if pinned.is_empty() {
        let mut principals: Vec<&CharacterProfile> = bundle
            .characters
            .iter()
            .filter(|c| c.role != CharacterRole::Minor)
            .collect();
        principals.truncate(5);
        principals
    } else {
        let mut unique = Vec::new();
        for character in pinned {
            if !unique
                .iter()
                .any(|c: &&CharacterProfile| c.name == character.name)
            {
                unique.push(character);
            }
        }
        unique
    };

    selected
        .iter()
        .map(|character| {
            let mut line = format!("{} ({})", character.name, character.role.as_str());
            if !character.traits.is_empty() {
                line.push_str(&format!(
                    ": {}",
                    character
                        .traits
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            for (other, relation) in &character.relationships {
                line.push_str(&format!("; {relation} of {other}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn task_block(inputs: &PromptInputs<'_>) -> String {
    let chapter = inputs.chapter_number;
    let length = inputs.target_length;
    let mut task = match inputs.mode {
        GenerationMode::Full => format!(
            "Write chapter {chapter} in full, around {length} words. Open \
             mid-scene, end with forward pull."
        ),
        GenerationMode::Continue => format!(
            "Write chapter {chapter}, continuing seamlessly from the \
             preceding text, around {length} words. Do not recap."
        ),
        GenerationMode::Expand => format!(
            "Expand the preceding passage of chapter {chapter} with richer \
             detail and interiority, to around {length} words. Preserve \
             every established event."
        ),
        GenerationMode::Rewrite => format!(
            "Rewrite chapter {chapter} from scratch, around {length} words. \
             Keep the chapter's place in the story but apply the constraints \
             below."
        ),
        GenerationMode::Outline => format!(
            "Write a numbered outline of the next chapters starting at \
             chapter {chapter}: one paragraph per chapter, stakes and turns \
             explicit."
        ),
    };

    for constraint in inputs.constraints {
        task.push_str(&format!("\nConstraint: {constraint}"));
    }
    task
}

fn clip_to_tokens(text: &str, cap: u32) -> String {
    if estimate_tokens(text) <= cap {
        return text.to_string();
    }
    let mut out = String::new();
    for line in text.lines() {
        let with_line = if out.is_empty() {
            line.to_string()
        } else {
            format!("{out}\n{line}")
        };
        if estimate_tokens(&with_line) > cap {
            break;
        }
        out = with_line;
    }
    out
}
