use crate::config::ConsistencyWeights;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// What a sub-checker found and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnknownName,
    NameMisspelling,
    RoleContradiction,
    TraitReversal,
    AsymmetricRelationship,
    WorldRuleContradiction,
    AmbiguousWorldRule,
    UnknownPlotCharacter,
    UnresolvedForeshadowing,
}

/// Where in the story state the issue sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Locus {
    Character(String),
    World,
    Plot(String),
    Chapter(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub locus: Locus,
    pub description: String,
}

impl ConsistencyIssue {
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        locus: Locus,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            locus,
            description: description.into(),
        }
    }
}

/// Advisory report: `score = 1 − (0.3·errors + 0.1·warns + 0.02·infos)`,
/// clamped to [0, 1]. Issues are kept ordered by severity, errors first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub score: f64,
    pub issues: Vec<ConsistencyIssue>,
}

impl Default for ConsistencyReport {
    fn default() -> Self {
        Self {
            score: 1.0,
            issues: Vec::new(),
        }
    }
}

impl ConsistencyReport {
    #[must_use]
    pub fn clean() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_issues(mut issues: Vec<ConsistencyIssue>, weights: &ConsistencyWeights) -> Self {
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        let mut penalty = 0.0;
        for issue in &issues {
            penalty += match issue.severity {
                Severity::Error => weights.error,
                Severity::Warn => weights.warn,
                Severity::Info => weights.info,
            };
        }
        Self {
            score: (1.0 - penalty).clamp(0.0, 1.0),
            issues,
        }
    }

    #[must_use]
    pub fn errors(&self) -> impl Iterator<Item = &ConsistencyIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Whether this report blocks generation under the configured floor.
    #[must_use]
    pub fn blocks_generation(&self, threshold: f64) -> bool {
        self.score < threshold
    }

    /// Merge two reports into one, recomputing the score.
    #[must_use]
    pub fn merged(self, other: Self, weights: &ConsistencyWeights) -> Self {
        let mut issues = self.issues;
        issues.extend(other.issues);
        Self::from_issues(issues, weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> ConsistencyWeights {
        ConsistencyWeights::default()
    }

    fn issue(severity: Severity) -> ConsistencyIssue {
        ConsistencyIssue::new(
            IssueKind::UnknownName,
            severity,
            Locus::Character("X".into()),
            "test issue",
        )
    }

    #[test]
    fn empty_report_scores_one() {
        let report = ConsistencyReport::from_issues(vec![], &weights());
        assert!((report.score - 1.0).abs() < f64::EPSILON);
        assert!(!report.blocks_generation(0.5));
    }

    #[test]
    fn penalty_weights_match_rule() {
        let report = ConsistencyReport::from_issues(
            vec![issue(Severity::Error), issue(Severity::Warn), issue(Severity::Info)],
            &weights(),
        );
        assert!((report.score - (1.0 - 0.3 - 0.1 - 0.02)).abs() < 1e-9);
    }

    #[test]
    fn adding_an_error_strictly_decreases_score() {
        let one = ConsistencyReport::from_issues(vec![issue(Severity::Error)], &weights());
        let two = ConsistencyReport::from_issues(
            vec![issue(Severity::Error), issue(Severity::Error)],
            &weights(),
        );
        assert!(two.score < one.score);
    }

    #[test]
    fn score_clamps_at_zero() {
        let issues: Vec<_> = (0..10).map(|_| issue(Severity::Error)).collect();
        let report = ConsistencyReport::from_issues(issues, &weights());
        assert!((report.score).abs() < f64::EPSILON);
    }

    #[test]
    fn two_errors_block_generation_at_default_threshold() {
        let report = ConsistencyReport::from_issues(
            vec![issue(Severity::Error), issue(Severity::Error)],
            &weights(),
        );
        assert!((report.score - 0.4).abs() < 1e-9);
        assert!(report.blocks_generation(0.5));
    }

    #[test]
    fn issues_ordered_by_severity() {
        let report = ConsistencyReport::from_issues(
            vec![issue(Severity::Info), issue(Severity::Error), issue(Severity::Warn)],
            &weights(),
        );
        assert_eq!(report.issues[0].severity, Severity::Error);
        assert_eq!(report.issues[2].severity, Severity::Info);
    }

    #[test]
    fn merged_recomputes() {
        let a = ConsistencyReport::from_issues(vec![issue(Severity::Warn)], &weights());
        let b = ConsistencyReport::from_issues(vec![issue(Severity::Warn)], &weights());
        let merged = a.merged(b, &weights());
        assert_eq!(merged.issues.len(), 2);
        assert!((merged.score - 0.8).abs() < 1e-9);
    }
}
