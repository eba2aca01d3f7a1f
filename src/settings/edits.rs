use super::models::{
    CharacterProfile, CharacterRole, PlotPoint, SettingsBundle, WorldSetting,
};
use serde::{Deserialize, Serialize};

/// Scalar world fields addressable by an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldField {
    Genre,
    Era,
    TechnologyLevel,
}

/// Closed union of setting mutations. The extractor and the AI completer
/// both emit sequences of these; the bundle applies them deterministically,
/// and re-applying a sequence is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SettingEdit {
    UpsertCharacter {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<CharacterRole>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<String>,
        #[serde(default)]
        ai_generated: bool,
    },
    AddTrait {
        character: String,
        value: String,
    },
    AddRelationship {
        character: String,
        other: String,
        relation: String,
    },
    AddLocation {
        name: String,
    },
    UpsertWorldField {
        field: WorldField,
        value: String,
        #[serde(default)]
        ai_generated: bool,
    },
    AddWorldRule {
        rule: String,
    },
    AddPlotPoint {
        point: PlotPoint,
    },
    SetStyle {
        aspect: String,
        value: String,
    },
    AddTheme {
        theme: String,
    },
}

impl SettingsBundle {
    /// Apply one edit. Character lookups are name-keyed; unknown characters
    /// referenced by trait/relationship edits are created as Minor.
    pub fn apply_edit(&mut self, edit: &SettingEdit) {
        match edit {
            SettingEdit::UpsertCharacter {
                name,
                role,
                background,
                ai_generated,
            } => {
                let incoming = CharacterProfile {
                    name: name.clone(),
                    role: role.unwrap_or(CharacterRole::Minor),
                    traits: Default::default(),
                    background: background.clone(),
                    relationships: Default::default(),
                    ai_generated: *ai_generated,
                };
                match self.character_mut(name) {
                    Some(existing) => {
                        existing.merge(&incoming);
                        // An explicit role claim is an edit, not a merge.
                        if let Some(role) = role {
                            existing.role = *role;
                        }
                    }
                    None => self.characters.push(incoming),
                }
            }
            SettingEdit::AddTrait { character, value } => {
                self.ensure_character(character)
                    .traits
                    .insert(value.clone());
            }
            SettingEdit::AddRelationship {
                character,
                other,
                relation,
            } => {
                self.ensure_character(character)
                    .relationships
                    .insert(other.clone(), relation.clone());
            }
            SettingEdit::AddLocation { name } => self.world.add_location(name.clone()),
            SettingEdit::UpsertWorldField {
                field,
                value,
                ai_generated,
            } => {
                let world = &mut self.world;
                let slot = match field {
                    WorldField::Genre => &mut world.genre,
                    WorldField::Era => &mut world.era,
                    WorldField::TechnologyLevel => &mut world.technology_level,
                };
                *slot = Some(value.clone());
                if *ai_generated {
                    world.ai_generated = true;
                }
            }
            SettingEdit::AddWorldRule { rule } => {
                self.world.rules.insert(rule.clone());
            }
            SettingEdit::AddPlotPoint { point } => {
                // Append-only, de-duplicated by summary.
                if !self
                    .plot_points
                    .iter()
                    .any(|existing| existing.summary == point.summary)
                {
                    self.plot_points.push(point.clone());
                }
            }
            SettingEdit::SetStyle { aspect, value } => {
                self.style_hints.insert(aspect.clone(), value.clone());
            }
            SettingEdit::AddTheme { theme } => {
                if !self.themes.iter().any(|t| t.eq_ignore_ascii_case(theme)) {
                    self.themes.push(theme.clone());
                }
            }
        }
    }

    pub fn apply_edits(&mut self, edits: &[SettingEdit]) {
        for edit in edits {
            self.apply_edit(edit);
        }
    }

    /// Undo the field a rejected edit touched by restoring it from a
    /// pre-edit snapshot. Used when the conflict check flags an ERROR.
    pub fn roll_back_edit(&mut self, edit: &SettingEdit, previous: &Self) {
        match edit {
            SettingEdit::UpsertCharacter { name, .. }
            | SettingEdit::AddTrait {
                character: name, ..
            }
            | SettingEdit::AddRelationship {
                character: name, ..
            } => match previous.character(name) {
                Some(prior) => {
                    if let Some(current) = self.character_mut(name) {
                        *current = prior.clone();
                    }
                }
                None => self
                    .characters
                    .retain(|c| !c.name.eq_ignore_ascii_case(name)),
            },
            SettingEdit::AddLocation { .. }
            | SettingEdit::UpsertWorldField { .. }
            | SettingEdit::AddWorldRule { .. } => {
                self.world = previous.world.clone();
            }
            SettingEdit::AddPlotPoint { point } => {
                if !previous
                    .plot_points
                    .iter()
                    .any(|p| p.summary == point.summary)
                {
                    self.plot_points.retain(|p| p.summary != point.summary);
                }
            }
            SettingEdit::SetStyle { aspect, .. } => {
                match previous.style_hints.get(aspect) {
                    Some(value) => {
                        self.style_hints.insert(aspect.clone(), value.clone());
                    }
                    None => {
                        self.style_hints.remove(aspect);
                    }
                }
            }
            SettingEdit::AddTheme { theme } => {
                if !previous.themes.iter().any(|t| t.eq_ignore_ascii_case(theme)) {
                    self.themes.retain(|t| !t.eq_ignore_ascii_case(theme));
                }
            }
        }
    }

    fn ensure_character(&mut self, name: &str) -> &mut CharacterProfile {
        if self.character(name).is_none() {
            self.characters
                .push(CharacterProfile::new(name, CharacterRole::Minor));
        }
        self.character_mut(name).expect("character just ensured")
    }
}

/// Convenience for tests and the completer: a world built from edits only.
#[must_use]
pub fn world_from_edits(edits: &[SettingEdit]) -> WorldSetting {
    let mut bundle = SettingsBundle::default();
    bundle.apply_edits(edits);
    bundle.world
}
