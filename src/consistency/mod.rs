// Consistency checking across settings and generated chapters: three
// sub-checkers feed one severity-weighted advisory report.

pub mod character;
pub mod plot;
pub mod report;
pub mod world;

pub use character::CharacterTracker;
pub use plot::PlotChecker;
pub use report::{ConsistencyIssue, ConsistencyReport, IssueKind, Locus, Severity};
pub use world::WorldRuleChecker;

use crate::config::ConsistencyWeights;
use crate::llm::LlmGateway;
use crate::settings::SettingsBundle;
use std::sync::Arc;

/// Facade over the three sub-checkers. Reports are advisory: they never
/// overwrite user intent, but the agent refuses to generate below the
/// configured score floor.
pub struct ConsistencyChecker {
    characters: CharacterTracker,
    world: WorldRuleChecker,
    plot: PlotChecker,
    weights: ConsistencyWeights,
}

impl ConsistencyChecker {
    #[must_use]
    pub fn new(weights: ConsistencyWeights) -> Self {
        Self {
            characters: CharacterTracker::new(),
            world: WorldRuleChecker::new(),
            plot: PlotChecker::new(),
            weights,
        }
    }

    /// Attach a gateway for ambiguous world-rule verdicts.
    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.world = WorldRuleChecker::with_gateway(gateway);
        self
    }

    /// Check a proposed settings change against the prior bundle.
    pub async fn check_change(
        &self,
        previous: &SettingsBundle,
        proposed: &SettingsBundle,
    ) -> ConsistencyReport {
        let mut issues = self.characters.check_change(previous, proposed);
        issues.extend(self.world.check_change(previous, proposed).await);
        issues.extend(self.plot.check(proposed, false));
        ConsistencyReport::from_issues(issues, &self.weights)
    }

    /// Check a generated chapter against the bundle it was produced from.
    #[must_use]
    pub fn check_chapter(
        &self,
        bundle: &SettingsBundle,
        content: &str,
        final_chapter: bool,
    ) -> ConsistencyReport {
        let mut issues = self.characters.check_text(bundle, content);
        issues.extend(self.characters.check_relationship_symmetry(bundle));
        issues.extend(self.plot.check(bundle, final_chapter));
        ConsistencyReport::from_issues(issues, &self.weights)
    }

    #[must_use]
    pub fn weights(&self) -> &ConsistencyWeights {
        &self.weights
    }
}
