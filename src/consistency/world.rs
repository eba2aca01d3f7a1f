use super::report::{ConsistencyIssue, IssueKind, Locus, Severity};
use crate::llm::{ChatMessage, ChatRequest, LlmGateway};
use crate::settings::SettingsBundle;
use std::sync::Arc;

/// Checks new world assertions against established rules and plot facts.
///
/// Direct negations resolve locally through a light contradiction matrix;
/// genuinely ambiguous pairs are put to the gateway for a yes/no verdict
/// when one is attached, and downgraded to INFO otherwise.
pub struct WorldRuleChecker {
    gateway: Option<Arc<LlmGateway>>,
}

impl Default for WorldRuleChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldRuleChecker {
    #[must_use]
    pub fn new() -> Self {
        Self { gateway: None }
    }

    #[must_use]
    pub fn with_gateway(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway: Some(gateway),
        }
    }

    /// Check the rules newly present in `proposed` against everything the
    /// prior bundle asserts (rules, plot summaries, era/genre facts).
    pub async fn check_change(
        &self,
        previous: &SettingsBundle,
        proposed: &SettingsBundle,
    ) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();

        let new_rules: Vec<&String> = proposed
            .world
            .rules
            .iter()
            .filter(|rule| !previous.world.rules.contains(*rule))
            .collect();

        for rule in new_rules {
            match self.classify_rule(previous, rule).await {
                RuleVerdict::Contradiction { against } => {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::WorldRuleContradiction,
                        Severity::Error,
                        Locus::World,
                        format!("\"{rule}\" contradicts established story fact: {against}"),
                    ));
                }
                RuleVerdict::Ambiguous { against } => {
                    issues.push(ConsistencyIssue::new(
                        IssueKind::AmbiguousWorldRule,
                        Severity::Info,
                        Locus::World,
                        format!("\"{rule}\" may conflict with: {against}"),
                    ));
                }
                RuleVerdict::Consistent => {}
            }
        }

        // Era rewrites of an established era are contradictions too.
        if let (Some(prior_era), Some(new_era)) =
            (previous.world.era.as_deref(), proposed.world.era.as_deref())
        {
            if prior_era != new_era && !previous.plot_points.is_empty() {
                issues.push(ConsistencyIssue::new(
                    IssueKind::WorldRuleContradiction,
                    Severity::Error,
                    Locus::World,
                    format!("era changed from {prior_era} to {new_era} after plot was established"),
                ));
            }
        }

        issues
    }

    async fn classify_rule(&self, previous: &SettingsBundle, rule: &str) -> RuleVerdict {
        // Matrix row 1: "no X" against any prior mention of X.
        if let Some(subject) = negated_subject(rule) {
            if let Some(against) = find_assertion_about(previous, &subject) {
                return RuleVerdict::Contradiction { against };
            }
            return RuleVerdict::Consistent;
        }

        // Matrix row 2: "X …" against a prior "no X".
        let rule_lower = rule.to_lowercase();
        for prior in &previous.world.rules {
            if let Some(prior_subject) = negated_subject(prior) {
                if rule_lower.contains(&prior_subject) {
                    return RuleVerdict::Contradiction {
                        against: prior.clone(),
                    };
                }
            }
        }

        // Shared subject without an obvious negation: ambiguous.
        for prior in &previous.world.rules {
            if prior != rule && shares_subject(prior, rule) {
                return self.resolve_ambiguity(prior, rule).await;
            }
        }

        RuleVerdict::Consistent
    }

    async fn resolve_ambiguity(&self, prior: &str, rule: &str) -> RuleVerdict {
        let Some(gateway) = &self.gateway else {
            return RuleVerdict::Ambiguous {
                against: prior.to_string(),
            };
        };

        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "You judge story world rules. Answer with exactly YES or NO.",
            ),
            ChatMessage::user(format!(
                "Do these two rules contradict each other?\nRule A: {prior}\nRule B: {rule}"
            )),
        ])
        .with_temperature(0.0)
        .with_max_tokens(4);

        match gateway.generate(&request).await {
            Ok(response) if response.content.trim().to_uppercase().starts_with("YES") => {
                RuleVerdict::Contradiction {
                    against: prior.to_string(),
                }
            }
            Ok(_) => RuleVerdict::Consistent,
            Err(error) => {
                tracing::debug!(error = %error, "world rule verdict unavailable");
                RuleVerdict::Ambiguous {
                    against: prior.to_string(),
                }
            }
        }
    }
}

enum RuleVerdict {
    Contradiction { against: String },
    Ambiguous { against: String },
    Consistent,
}

/// "no ai", "there is no magic", "magic does not exist" → the negated
/// subject, lowercased.
fn negated_subject(rule: &str) -> Option<String> {
    let lower = rule.trim().to_lowercase();
    for prefix in ["no ", "there is no ", "there are no ", "there's no "] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            let subject = rest
                .split_whitespace()
                .take(3)
                .collect::<Vec<_>>()
                .join(" ");
            if !subject.is_empty() {
                return Some(subject);
            }
        }
    }
    for suffix in [" does not exist", " doesn't exist", " don't exist", " do not exist"] {
        if let Some(subject) = lower.strip_suffix(suffix) {
            if !subject.is_empty() {
                return Some(subject.to_string());
            }
        }
    }
    None
}

/// Any prior assertion (rule, plot summary, theme) mentioning the subject.
fn find_assertion_about(bundle: &SettingsBundle, subject: &str) -> Option<String> {
    let needle = subject.to_lowercase();
    let mentions = |text: &str| {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == needle)
            || text.to_lowercase().contains(&format!(" {needle} "))
            || text.to_lowercase().contains(&needle) && needle.contains(' ')
    };

    for rule in &bundle.world.rules {
        if negated_subject(rule).is_none() && mentions(rule) {
            return Some(rule.clone());
        }
    }
    for point in &bundle.plot_points {
        if mentions(&point.summary) {
            return Some(point.summary.clone());
        }
    }
    for theme in &bundle.themes {
        if mentions(theme) {
            return Some(theme.clone());
        }
    }
    None
}

fn shares_subject(a: &str, b: &str) -> bool {
    let stop = ["the", "a", "an", "is", "are", "in", "of", "and", "or", "no"];
    let words_a: Vec<String> = a
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !stop.contains(w))
        .map(str::to_string)
        .collect();
    b.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !stop.contains(w))
        .any(|w| words_a.iter().any(|a| a == w))
}
