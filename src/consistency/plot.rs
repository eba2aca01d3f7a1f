use super::report::{ConsistencyIssue, IssueKind, Locus, Severity};
use crate::settings::{PlotPointKind, SettingsBundle};

/// Checks plot points for dangling references and unpaid foreshadowing.
#[derive(Debug, Default)]
pub struct PlotChecker;

impl PlotChecker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate the plot graph inside a bundle. `at_resolution` escalates
    /// unresolved foreshadowing from INFO to WARN; it is driven by an
    /// explicit flag (a Resolution-kind point or the caller saying so),
    /// never inferred from prose.
    #[must_use]
    pub fn check(&self, bundle: &SettingsBundle, at_resolution: bool) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();

        let resolution_reached = at_resolution
            || bundle
                .plot_points
                .iter()
                .any(|p| p.kind == PlotPointKind::Resolution);

        for point in &bundle.plot_points {
            // Involved characters must exist in the bundle.
            for name in &point.involved_characters {
                if bundle.character(name).is_none() {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::UnknownPlotCharacter,
                        Severity::Warn,
                        Locus::Plot(point.summary.clone()),
                        format!("plot point involves unknown character {name}"),
                    ));
                }
            }

            // Setup/inciting threads left open: a note while the story is
            // ongoing, a warning once the story claims resolution.
            let foreshadows = matches!(
                point.kind,
                PlotPointKind::Setup | PlotPointKind::Inciting | PlotPointKind::Subplot
            );
            if foreshadows && !point.resolved {
                let severity = if resolution_reached && point.kind != PlotPointKind::Subplot {
                    Severity::Warn
                } else {
                    Severity::Info
                };
                issues.push(ConsistencyIssue::new(
                    IssueKind::UnresolvedForeshadowing,
                    severity,
                    Locus::Plot(point.summary.clone()),
                    format!("\"{}\" is foreshadowed but not resolved", point.summary),
                ));
            }
        }

        issues
    }
}
