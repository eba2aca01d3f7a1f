use super::models::SettingsBundle;
use serde::{Deserialize, Serialize};

/// Required setting slots, weighted. A bundle is generation-ready once the
/// weighted sum of filled slots crosses the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredSlot {
    Protagonist,
    Conflict,
    Genre,
    Location,
}

impl RequiredSlot {
    pub const ALL: [Self; 4] = [
        Self::Protagonist,
        Self::Conflict,
        Self::Genre,
        Self::Location,
    ];

    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Protagonist | Self::Conflict => 0.3,
            Self::Genre | Self::Location => 0.2,
        }
    }

    #[must_use]
    pub fn is_filled(self, bundle: &SettingsBundle) -> bool {
        match self {
            Self::Protagonist => bundle.protagonist().is_some(),
            Self::Conflict => !bundle.plot_points.is_empty(),
            Self::Genre => bundle
                .world
                .genre
                .as_deref()
                .map_or(false, |g| !g.trim().is_empty()),
            Self::Location => !bundle.world.locations.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// Weighted sum over filled slots, in [0, 1].
    pub score: f64,
    pub missing: Vec<RequiredSlot>,
}

impl CompletenessReport {
    #[must_use]
    pub fn is_ready(&self, threshold: f64) -> bool {
        self.score >= threshold
    }
}

/// Score a bundle against the required slots.
#[must_use]
pub fn check_completeness(bundle: &SettingsBundle) -> CompletenessReport {
    let mut score = 0.0;
    let mut missing = Vec::new();
    for slot in RequiredSlot::ALL {
        if slot.is_filled(bundle) {
            score += slot.weight();
        } else {
            missing.push(slot);
        }
    }
    CompletenessReport {
        score: score.clamp(0.0, 1.0),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::models::{
        CharacterProfile, CharacterRole, PlotPoint, PlotPointKind,
    };

    fn full_bundle() -> SettingsBundle {
        let mut bundle = SettingsBundle {
            characters: vec![CharacterProfile::new("Lin Feng", CharacterRole::Protagonist)],
            plot_points: vec![PlotPoint::new(PlotPointKind::Inciting, "an AI goes missing")],
            ..SettingsBundle::default()
        };
        bundle.world.genre = Some("cyberpunk".into());
        bundle.world.add_location("Shanghai");
        bundle
    }

    #[test]
    fn empty_bundle_scores_zero() {
        let report = check_completeness(&SettingsBundle::default());
        assert!((report.score).abs() < f64::EPSILON);
        assert_eq!(report.missing.len(), 4);
    }

    #[test]
    fn full_bundle_scores_one() {
        let report = check_completeness(&full_bundle());
        assert!((report.score - 1.0).abs() < 1e-9);
        assert!(report.missing.is_empty());
        assert!(report.is_ready(0.7));
    }

    #[test]
    fn missing_location_scores_point_eight() {
        let mut bundle = full_bundle();
        bundle.world.locations.clear();
        let report = check_completeness(&bundle);
        assert!((report.score - 0.8).abs() < 1e-9);
        assert_eq!(report.missing, vec![RequiredSlot::Location]);
        assert!(report.is_ready(0.7));
    }

    #[test]
    fn missing_protagonist_blocks_readiness() {
        let mut bundle = full_bundle();
        bundle.characters.clear();
        let report = check_completeness(&bundle);
        assert!((report.score - 0.7).abs() < 1e-9);
        assert!(report.is_ready(0.7));

        bundle.plot_points.clear();
        let report = check_completeness(&bundle);
        assert!((report.score - 0.4).abs() < 1e-9);
        assert!(!report.is_ready(0.7));
    }

    #[test]
    fn blank_genre_counts_as_missing() {
        let mut bundle = full_bundle();
        bundle.world.genre = Some("  ".into());
        let report = check_completeness(&bundle);
        assert!(report.missing.contains(&RequiredSlot::Genre));
    }
}
