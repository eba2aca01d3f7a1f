use super::completeness::{check_completeness, CompletenessReport};
use super::completer::AiCompleter;
use super::edits::SettingEdit;
use super::extractor::SettingExtractor;
use super::models::SettingsBundle;
use crate::consistency::{ConsistencyChecker, ConsistencyReport, Locus, Severity};

/// Result of running one user turn through the extraction pipeline.
/// Infallible by contract: extraction trouble degrades the update, it
/// never aborts the turn.
#[derive(Debug, Clone)]
pub struct SettingUpdate {
    pub bundle: SettingsBundle,
    pub completeness: CompletenessReport,
    pub consistency: ConsistencyReport,
    /// Edits undone because the conflict check flagged them as errors.
    pub rolled_back: Vec<SettingEdit>,
    /// Internal notes surfaced to the agent (never directly to the user).
    pub notes: Vec<String>,
}

/// Per-turn pipeline: extract fragments, merge, score completeness, fill
/// gaps through the LLM, then conflict-check the whole change and roll
/// back any edit the checker rejects.
pub struct SettingPipeline {
    extractor: SettingExtractor,
    completion_threshold: f64,
}

impl SettingPipeline {
    #[must_use]
    pub fn new(completion_threshold: f64) -> Self {
        Self {
            extractor: SettingExtractor::new(),
            completion_threshold,
        }
    }

    pub async fn run(
        &self,
        current: &SettingsBundle,
        user_text: &str,
        completer: &AiCompleter,
        checker: &ConsistencyChecker,
    ) -> SettingUpdate {
        // 1–2: extract and merge.
        let mut applied = self.extractor.extract(user_text);
        let mut proposed = current.clone();
        proposed.apply_edits(&applied);

        // 3: completeness over the merged bundle.
        let completeness = check_completeness(&proposed);

        // 4: AI completion of missing slots. Two parse failures keep prior
        // state; a turn never dies here.
        if !completeness.is_ready(self.completion_threshold) {
            match completer.complete(&proposed, &completeness.missing).await {
                Ok(completion_edits) => {
                    proposed.apply_edits(&completion_edits);
                    applied.extend(completion_edits);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "setting completion skipped");
                }
            }
        }

        // 5: conflict check; ERROR findings roll the offending edits back.
        let consistency = checker.check_change(current, &proposed).await;
        let mut rolled_back = Vec::new();
        let mut notes = Vec::new();

        if consistency.has_errors() {
            let error_loci: Vec<Locus> = consistency
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Error)
                .map(|issue| issue.locus.clone())
                .collect();

            for edit in applied.iter().rev() {
                if error_loci.iter().any(|locus| edit_touches_locus(edit, locus)) {
                    proposed.roll_back_edit(edit, current);
                    rolled_back.push(edit.clone());
                }
            }

            for issue in consistency.errors() {
                notes.push(format!(
                    "kept prior setting; rejected change: {}",
                    issue.description
                ));
            }
        }

        let completeness = check_completeness(&proposed);

        SettingUpdate {
            bundle: proposed,
            completeness,
            consistency,
            rolled_back,
            notes,
        }
    }
}

fn edit_touches_locus(edit: &SettingEdit, locus: &Locus) -> bool {
    match locus {
        Locus::Character(name) => match edit {
            SettingEdit::UpsertCharacter { name: edit_name, .. }
            | SettingEdit::AddTrait {
                character: edit_name,
                ..
            }
            | SettingEdit::AddRelationship {
                character: edit_name,
                ..
            } => edit_name.eq_ignore_ascii_case(name),
            _ => false,
        },
        Locus::World => matches!(
            edit,
            SettingEdit::AddWorldRule { .. }
                | SettingEdit::UpsertWorldField { .. }
                | SettingEdit::AddLocation { .. }
        ),
        Locus::Plot(summary) => matches!(
            edit,
            SettingEdit::AddPlotPoint { point } if point.summary == *summary
        ),
        Locus::Chapter(_) => false,
    }
}
