// Conversational setting inference: extract fragments from dialogue, merge
// them into the authoritative bundle, complete gaps via the LLM, and guard
// the result with the consistency checker.

pub mod completeness;
pub mod completer;
pub mod edits;
pub mod extractor;
pub mod models;
pub mod pipeline;

pub use completeness::{check_completeness, CompletenessReport, RequiredSlot};
pub use completer::AiCompleter;
pub use edits::{SettingEdit, WorldField};
pub use extractor::SettingExtractor;
pub use models::{
    CharacterProfile, CharacterRole, PlotPoint, PlotPointKind, SettingsBundle, WorldSetting,
};
pub use pipeline::{SettingPipeline, SettingUpdate};
