use super::completeness::RequiredSlot;
use super::edits::{SettingEdit, WorldField};
use super::models::{CharacterRole, PlotPoint, PlotPointKind, SettingsBundle};
use crate::error::ExtractionError;
use crate::llm::{ChatMessage, ChatRequest, LlmGateway};
use std::sync::Arc;

const COMPLETER_SYSTEM_PROMPT: &str = "You fill gaps in a novel's settings. \
Given the current settings and a list of missing slots, invent fitting values. \
Reply with one compact JSON object and nothing else.";

/// Fills missing required slots through the gateway. Completed fields are
/// marked `ai_generated` so user-stated facts stay distinguishable.
pub struct AiCompleter {
    gateway: Arc<LlmGateway>,
    max_parse_attempts: u32,
}

impl AiCompleter {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            max_parse_attempts: 2,
        }
    }

    /// Ask for the missing slots and translate the reply into edits.
    /// Parse failures get one fresh prompt; after the second failure the
    /// caller keeps prior state.
    pub async fn complete(
        &self,
        bundle: &SettingsBundle,
        missing: &[RequiredSlot],
    ) -> Result<Vec<SettingEdit>, ExtractionError> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_error = String::new();
        for attempt in 0..self.max_parse_attempts {
            let request = self.build_request(bundle, missing, attempt);
            let response = match self.gateway.generate(&request).await {
                Ok(response) => response,
                Err(error) => {
                    // An unreachable gateway is a parse-path failure from the
                    // caller's point of view: the turn proceeds without
                    // completion.
                    return Err(ExtractionError::Parse(error.to_string()));
                }
            };

            match parse_completion(&response.content) {
                Ok(edits) => return Ok(edits),
                Err(error) => {
                    tracing::debug!(attempt, error = %error, "completion parse failed");
                    last_error = error;
                }
            }
        }

        Err(ExtractionError::Parse(last_error))
    }

    fn build_request(
        &self,
        bundle: &SettingsBundle,
        missing: &[RequiredSlot],
        attempt: u32,
    ) -> ChatRequest {
        let mut shape = Vec::new();
        for slot in missing {
            match slot {
                RequiredSlot::Genre => shape.push("\"genre\": \"...\""),
                RequiredSlot::Location => shape.push("\"locations\": [\"...\"]"),
                RequiredSlot::Protagonist => shape.push(
                    "\"protagonist\": {\"name\": \"...\", \"traits\": [\"...\"], \"background\": \"...\"}",
                ),
                RequiredSlot::Conflict => shape.push("\"conflict\": \"...\""),
            }
        }

        let current = serde_json::to_string(bundle).unwrap_or_default();
        let mut prompt = format!(
            "Current settings: {current}\n\nInvent the missing slots. Reply with JSON shaped like:\n{{{}}}",
            shape.join(", ")
        );
        if attempt > 0 {
            prompt.push_str("\n\nReturn ONLY the JSON object, no prose, no code fences.");
        }

        ChatRequest::new(vec![
            ChatMessage::system(COMPLETER_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_temperature(0.6)
        .with_max_tokens(600)
    }
}

/// Tolerant parse: find the first balanced JSON object anywhere in the
/// reply, then pull known keys out of it. Unknown keys are ignored.
pub fn parse_completion(reply: &str) -> Result<Vec<SettingEdit>, String> {
    let json_slice = balanced_json_object(reply).ok_or("no JSON object in reply")?;
    let value: serde_json::Value =
        serde_json::from_str(json_slice).map_err(|e| format!("invalid JSON: {e}"))?;
    let object = value.as_object().ok_or("top level is not an object")?;

    let mut edits = Vec::new();

    if let Some(genre) = object.get("genre").and_then(|v| v.as_str()) {
        edits.push(SettingEdit::UpsertWorldField {
            field: WorldField::Genre,
            value: genre.to_string(),
            ai_generated: true,
        });
    }

    if let Some(era) = object.get("era").and_then(|v| v.as_str()) {
        edits.push(SettingEdit::UpsertWorldField {
            field: WorldField::Era,
            value: era.to_string(),
            ai_generated: true,
        });
    }

    match object.get("locations") {
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                if let Some(name) = item.as_str() {
                    edits.push(SettingEdit::AddLocation {
                        name: name.to_string(),
                    });
                }
            }
        }
        Some(serde_json::Value::String(name)) => edits.push(SettingEdit::AddLocation {
            name: name.clone(),
        }),
        _ => {}
    }

    if let Some(protagonist) = object.get("protagonist") {
        push_character_edits(protagonist, Some(CharacterRole::Protagonist), &mut edits);
    }

    if let Some(serde_json::Value::Array(characters)) = object.get("characters") {
        for character in characters {
            push_character_edits(character, None, &mut edits);
        }
    }

    if let Some(conflict) = object.get("conflict").and_then(|v| v.as_str()) {
        edits.push(SettingEdit::AddPlotPoint {
            point: PlotPoint::new(PlotPointKind::Inciting, conflict),
        });
    }

    if edits.is_empty() {
        return Err("JSON object carried no recognized slots".into());
    }
    Ok(edits)
}

fn push_character_edits(
    value: &serde_json::Value,
    forced_role: Option<CharacterRole>,
    edits: &mut Vec<SettingEdit>,
) {
    let Some(object) = value.as_object() else {
        return;
    };
    let Some(name) = object.get("name").and_then(|v| v.as_str()) else {
        return;
    };
    let name = name.trim();
    if name.is_empty() {
        return;
    }

    let role = forced_role.or_else(|| {
        object
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(parse_role)
    });

    edits.push(SettingEdit::UpsertCharacter {
        name: name.to_string(),
        role,
        background: object
            .get("background")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        ai_generated: true,
    });

    if let Some(serde_json::Value::Array(traits)) = object.get("traits") {
        for value in traits {
            if let Some(trait_value) = value.as_str() {
                edits.push(SettingEdit::AddTrait {
                    character: name.to_string(),
                    value: trait_value.to_string(),
                });
            }
        }
    }
}

fn parse_role(role: &str) -> Option<CharacterRole> {
    match role.trim().to_ascii_lowercase().as_str() {
        "protagonist" | "hero" | "heroine" => Some(CharacterRole::Protagonist),
        "antagonist" | "villain" => Some(CharacterRole::Antagonist),
        "supporting" => Some(CharacterRole::Supporting),
        "minor" => Some(CharacterRole::Minor),
        _ => None,
    }
}

/// Balanced-brace scan honoring JSON string escapes. Returns the first
/// complete top-level object slice.
fn balanced_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_scan_ignores_prose_and_fences() {
        let reply = "Sure! Here are the settings:\n```json\n{\"genre\": \"cyberpunk\"}\n```\nHope that helps.";
        assert_eq!(balanced_json_object(reply), Some("{\"genre\": \"cyberpunk\"}"));
    }

    #[test]
    fn balanced_scan_handles_nested_and_strings() {
        let reply = r#"{"a": {"b": "brace } in string"}, "c": 1} trailing"#;
        let slice = balanced_json_object(reply).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(slice).is_ok());
    }

    #[test]
    fn parse_extracts_all_slot_kinds() {
        let reply = r#"{
            "genre": "cyberpunk",
            "era": "2077",
            "locations": ["Shanghai", "Chongqing"],
            "protagonist": {"name": "Lin Feng", "traits": ["ex-detective"], "background": "left the force"},
            "conflict": "an AI has gone missing"
        }"#;
        let edits = parse_completion(reply).unwrap();

        let mut bundle = SettingsBundle::default();
        bundle.apply_edits(&edits);

        assert_eq!(bundle.world.genre.as_deref(), Some("cyberpunk"));
        assert!(bundle.world.ai_generated);
        assert_eq!(bundle.world.locations.len(), 2);
        let lin = bundle.character("Lin Feng").unwrap();
        assert_eq!(lin.role, CharacterRole::Protagonist);
        assert!(lin.ai_generated);
        assert!(lin.traits.contains("ex-detective"));
        assert_eq!(bundle.plot_points.len(), 1);
    }

    #[test]
    fn parse_accepts_character_array_with_roles() {
        let reply = r#"{"characters": [
            {"name": "Mara", "role": "antagonist"},
            {"name": "Tono", "role": "supporting", "traits": ["loyal"]}
        ]}"#;
        let edits = parse_completion(reply).unwrap();
        let mut bundle = SettingsBundle::default();
        bundle.apply_edits(&edits);
        assert_eq!(bundle.character("Mara").unwrap().role, CharacterRole::Antagonist);
        assert!(bundle.character("Tono").unwrap().traits.contains("loyal"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_completion("no json here at all").is_err());
        assert!(parse_completion("{\"unknown_key\": 1}").is_err());
        assert!(parse_completion("{broken json").is_err());
    }

    #[tokio::test]
    async fn completer_returns_edits_from_scripted_reply() {
        use crate::config::Config;
        use crate::llm::MockProvider;

        let provider = Arc::new(
            MockProvider::new().with_reply(r#"{"genre": "wuxia", "locations": ["Jianghu"]}"#),
        );
        let gateway = Arc::new(LlmGateway::new(provider, &Config::default()));
        let completer = AiCompleter::new(gateway);

        let edits = completer
            .complete(
                &SettingsBundle::default(),
                &[RequiredSlot::Genre, RequiredSlot::Location],
            )
            .await
            .unwrap();
        assert_eq!(edits.len(), 2);
    }

    #[tokio::test]
    async fn completer_retries_once_then_fails() {
        use crate::config::Config;
        use crate::llm::MockProvider;

        let provider = Arc::new(
            MockProvider::new()
                .with_reply("not json")
                .with_reply("still not json")
                .with_default_reply("never reached"),
        );
        let gateway = Arc::new(LlmGateway::new(provider.clone(), &Config::default()));
        let completer = AiCompleter::new(gateway);

        let result = completer
            .complete(&SettingsBundle::default(), &[RequiredSlot::Genre])
            .await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn nothing_missing_skips_the_call() {
        use crate::config::Config;
        use crate::llm::MockProvider;

        let provider = Arc::new(MockProvider::new());
        let gateway = Arc::new(LlmGateway::new(provider.clone(), &Config::default()));
        let completer = AiCompleter::new(gateway);

        let edits = completer
            .complete(&SettingsBundle::default(), &[])
            .await
            .unwrap();
        assert!(edits.is_empty());
        assert_eq!(provider.calls(), 0);
    }
}
