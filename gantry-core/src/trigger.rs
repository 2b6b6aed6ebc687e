//! Trigger matching
//!
//! Evaluates inbound webhook events against the pipeline's trigger filters.
//! Filters are tried in order and the first one whose clauses all hold wins.
//! A clause on a field the event does not carry is false whatever its
//! polarity, so malformed events never start a run.

use regex::Regex;

use crate::domain::pipeline::PipelineDefinition;
use crate::domain::run::EntryPoint;
use crate::domain::trigger::{FilterField, FilterPattern, TriggerFilter, WebhookEvent};
use crate::error::DefinitionError;

/// Outcome of evaluating an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Matched { filter: String, entry: EntryPoint },
    NoMatch,
}

impl TriggerDecision {
    pub fn is_match(&self) -> bool {
        matches!(self, TriggerDecision::Matched { .. })
    }
}

/// Compiled trigger filters
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    filters: Vec<CompiledFilter>,
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    name: String,
    entry: EntryPoint,
    clauses: Vec<CompiledClause>,
}

#[derive(Debug, Clone)]
struct CompiledClause {
    field: FilterField,
    pattern: CompiledPattern,
    exclude: bool,
}

#[derive(Debug, Clone)]
enum CompiledPattern {
    Exact(String),
    OneOf(Vec<String>),
    Anchored(Regex),
}

impl CompiledPattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            CompiledPattern::Exact(expected) => value == expected,
            CompiledPattern::OneOf(options) => options.iter().any(|o| o == value),
            CompiledPattern::Anchored(regex) => regex.is_match(value),
        }
    }
}

impl TriggerMatcher {
    /// Compiles the given filters, rejecting patterns that could match too broadly
    pub fn new(filters: &[TriggerFilter]) -> Result<Self, DefinitionError> {
        let filters = filters
            .iter()
            .map(compile_filter)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    /// Default filters of the definition's settings followed by its extra filters
    pub fn for_definition(definition: &PipelineDefinition) -> Result<Self, DefinitionError> {
        let mut filters = TriggerFilter::defaults_for(&definition.settings);
        filters.extend(definition.triggers.iter().cloned());
        Self::new(&filters)
    }

    pub fn evaluate(&self, event: &WebhookEvent) -> TriggerDecision {
        self.filters
            .iter()
            .find(|filter| filter.clauses.iter().all(|c| clause_holds(c, event)))
            .map(|filter| TriggerDecision::Matched {
                filter: filter.name.clone(),
                entry: filter.entry,
            })
            .unwrap_or(TriggerDecision::NoMatch)
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name.as_str()).collect()
    }
}

fn clause_holds(clause: &CompiledClause, event: &WebhookEvent) -> bool {
    match event.field(clause.field) {
        Some(value) => clause.pattern.matches(value) != clause.exclude,
        None => false,
    }
}

fn compile_filter(filter: &TriggerFilter) -> Result<CompiledFilter, DefinitionError> {
    let pattern_error = |detail: &str| DefinitionError::Pattern {
        filter: filter.name.clone(),
        detail: detail.to_string(),
    };

    if !filter.clauses.iter().any(|c| !c.exclude) {
        return Err(pattern_error(
            "filter needs at least one non-exclude clause",
        ));
    }

    let mut clauses = Vec::with_capacity(filter.clauses.len());
    for clause in &filter.clauses {
        let pattern = match &clause.pattern {
            FilterPattern::Exact(value) => {
                if value.is_empty() {
                    return Err(pattern_error("exact pattern cannot be empty"));
                }
                CompiledPattern::Exact(value.clone())
            }
            FilterPattern::OneOf(values) => {
                if values.is_empty() {
                    return Err(pattern_error("one_of pattern needs at least one value"));
                }
                CompiledPattern::OneOf(values.clone())
            }
            FilterPattern::Anchored(source) => {
                let Some(inner) = source
                    .strip_prefix('^')
                    .and_then(|rest| rest.strip_suffix('$'))
                else {
                    return Err(pattern_error(&format!(
                        "pattern '{}' must be anchored with ^ and $",
                        source
                    )));
                };
                // Grouped so alternation cannot escape the anchors
                let regex = Regex::new(&format!("^(?:{})$", inner))
                    .map_err(|e| pattern_error(&e.to_string()))?;
                CompiledPattern::Anchored(regex)
            }
        };

        clauses.push(CompiledClause {
            field: clause.field,
            pattern,
            exclude: clause.exclude,
        });
    }

    Ok(CompiledFilter {
        name: filter.name.clone(),
        entry: filter.entry,
        clauses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::tests::sample_definition;
    use crate::domain::trigger::{
        EventType, FilterClause, PULL_REQUEST_FILTER, PUSH_FILTER, PullRequestAction,
    };

    fn matcher() -> TriggerMatcher {
        TriggerMatcher::for_definition(&sample_definition()).unwrap()
    }

    #[test]
    fn test_push_to_integration_branch_matches_source() {
        let decision = matcher().evaluate(&WebhookEvent::push("refs/heads/master"));
        assert_eq!(
            decision,
            TriggerDecision::Matched {
                filter: PUSH_FILTER.to_string(),
                entry: EntryPoint::Source,
            }
        );
    }

    #[test]
    fn test_push_to_other_branch_does_not_match() {
        let matcher = matcher();
        for git_ref in [
            "refs/heads/feature-x",
            "refs/heads/master-2",
            "refs/heads/maste",
            "master",
            "refs/tags/master",
        ] {
            assert!(
                !matcher.evaluate(&WebhookEvent::push(git_ref)).is_match(),
                "{} should not match",
                git_ref
            );
        }
    }

    #[test]
    fn test_pull_request_actions() {
        let matcher = matcher();
        for action in [
            PullRequestAction::Created,
            PullRequestAction::Updated,
            PullRequestAction::Reopened,
        ] {
            let event = WebhookEvent::pull_request(action, "refs/pull/1/head", "refs/heads/master");
            assert_eq!(
                matcher.evaluate(&event),
                TriggerDecision::Matched {
                    filter: PULL_REQUEST_FILTER.to_string(),
                    entry: EntryPoint::PullRequestValidation,
                }
            );
        }

        for action in [PullRequestAction::Closed, PullRequestAction::Other] {
            let event = WebhookEvent::pull_request(action, "refs/pull/1/head", "refs/heads/master");
            assert!(!matcher.evaluate(&event).is_match());
        }
    }

    #[test]
    fn test_pull_request_base_ref_is_anchored() {
        let matcher = matcher();
        for base_ref in [
            "refs/heads/master-2",
            "refs/heads/develop",
            "xrefs/heads/master",
            "refs/heads/master/x",
        ] {
            let event = WebhookEvent::pull_request(
                PullRequestAction::Created,
                "refs/pull/1/head",
                base_ref,
            );
            assert!(
                !matcher.evaluate(&event).is_match(),
                "{} should not match",
                base_ref
            );
        }
    }

    #[test]
    fn test_pull_request_event_never_matches_push_filter() {
        let mut event = WebhookEvent::pull_request(
            PullRequestAction::Closed,
            "refs/heads/master",
            "refs/heads/master",
        );
        assert!(!matcher().evaluate(&event).is_match());

        event.event_type = EventType::Push;
        event.action = None;
        assert!(matcher().evaluate(&event).is_match());
    }

    #[test]
    fn test_missing_fields_fail_closed() {
        let matcher = matcher();

        let mut push = WebhookEvent::push("refs/heads/master");
        push.git_ref = None;
        assert!(!matcher.evaluate(&push).is_match());

        let mut pr = WebhookEvent::pull_request(
            PullRequestAction::Created,
            "refs/pull/1/head",
            "refs/heads/master",
        );
        pr.base_ref = None;
        assert!(!matcher.evaluate(&pr).is_match());

        pr.base_ref = Some(String::new());
        assert!(!matcher.evaluate(&pr).is_match());
    }

    #[test]
    fn test_branch_with_regex_characters_is_escaped() {
        let mut definition = sample_definition();
        definition.settings.branch = "release.1".to_string();
        let matcher = TriggerMatcher::for_definition(&definition).unwrap();

        let event = |base: &str| {
            WebhookEvent::pull_request(PullRequestAction::Created, "refs/pull/1/head", base)
        };
        assert!(matcher.evaluate(&event("refs/heads/release.1")).is_match());
        assert!(!matcher.evaluate(&event("refs/heads/releaseX1")).is_match());
    }

    #[test]
    fn test_exclude_polarity_and_first_match_wins() {
        let filters = vec![
            TriggerFilter {
                name: "non-wip-branches".to_string(),
                entry: EntryPoint::Source,
                clauses: vec![
                    FilterClause::matching(
                        FilterField::EventType,
                        FilterPattern::Exact("push".to_string()),
                    ),
                    FilterClause::excluding(
                        FilterField::Ref,
                        FilterPattern::Anchored("^refs/heads/wip/.*$".to_string()),
                    ),
                ],
            },
            TriggerFilter {
                name: "any-push".to_string(),
                entry: EntryPoint::PullRequestValidation,
                clauses: vec![FilterClause::matching(
                    FilterField::EventType,
                    FilterPattern::Exact("push".to_string()),
                )],
            },
        ];
        let matcher = TriggerMatcher::new(&filters).unwrap();

        let decision = matcher.evaluate(&WebhookEvent::push("refs/heads/main"));
        assert_eq!(
            decision,
            TriggerDecision::Matched {
                filter: "non-wip-branches".to_string(),
                entry: EntryPoint::Source,
            }
        );

        let decision = matcher.evaluate(&WebhookEvent::push("refs/heads/wip/spike"));
        assert_eq!(
            decision,
            TriggerDecision::Matched {
                filter: "any-push".to_string(),
                entry: EntryPoint::PullRequestValidation,
            }
        );

        let mut no_ref = WebhookEvent::push("refs/heads/main");
        no_ref.git_ref = None;
        assert_eq!(
            matcher.evaluate(&no_ref),
            TriggerDecision::Matched {
                filter: "any-push".to_string(),
                entry: EntryPoint::PullRequestValidation,
            }
        );
    }

    #[test]
    fn test_unanchored_pattern_rejected() {
        let filters = vec![TriggerFilter {
            name: "loose".to_string(),
            entry: EntryPoint::Source,
            clauses: vec![FilterClause::matching(
                FilterField::Ref,
                FilterPattern::Anchored("refs/heads/main".to_string()),
            )],
        }];
        assert!(matches!(
            TriggerMatcher::new(&filters),
            Err(DefinitionError::Pattern { .. })
        ));
    }

    #[test]
    fn test_alternation_stays_anchored() {
        let filters = vec![TriggerFilter {
            name: "main-or-release".to_string(),
            entry: EntryPoint::Source,
            clauses: vec![FilterClause::matching(
                FilterField::Ref,
                FilterPattern::Anchored("^refs/heads/main|refs/heads/release$".to_string()),
            )],
        }];
        let matcher = TriggerMatcher::new(&filters).unwrap();

        for git_ref in ["refs/heads/main", "refs/heads/release"] {
            assert!(matcher.evaluate(&WebhookEvent::push(git_ref)).is_match());
        }
        for git_ref in [
            "refs/heads/main-hotfix",
            "refs/heads/mainline",
            "refs/tags/v1/refs/heads/release",
            "xrefs/heads/release",
        ] {
            assert!(
                !matcher.evaluate(&WebhookEvent::push(git_ref)).is_match(),
                "{} should not match",
                git_ref
            );
        }
    }

    #[test]
    fn test_exclude_only_filter_rejected() {
        let filters = vec![TriggerFilter {
            name: "everything-but".to_string(),
            entry: EntryPoint::Source,
            clauses: vec![FilterClause::excluding(
                FilterField::Ref,
                FilterPattern::Exact("refs/heads/main".to_string()),
            )],
        }];
        assert!(TriggerMatcher::new(&filters).is_err());
    }

    #[test]
    fn test_filter_names_in_evaluation_order() {
        assert_eq!(
            matcher().filter_names(),
            vec![PUSH_FILTER, PULL_REQUEST_FILTER]
        );
    }
}
