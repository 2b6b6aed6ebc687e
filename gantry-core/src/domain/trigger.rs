//! Trigger domain types
//!
//! Inbound webhook events and the filter rules that decide whether an event
//! starts a run.

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::PipelineSettings;
use crate::domain::run::EntryPoint;

/// Name of the filter that starts full pipeline runs on push
pub const PUSH_FILTER: &str = "push-to-integration-branch";
/// Name of the filter that starts pull-request validation runs
pub const PULL_REQUEST_FILTER: &str = "pull-request-validation";

/// Inbound webhook event from the source host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PullRequestAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl WebhookEvent {
    pub fn push(git_ref: impl Into<String>) -> Self {
        Self {
            git_ref: Some(git_ref.into()),
            event_type: EventType::Push,
            action: None,
            base_ref: None,
            commit: None,
        }
    }

    pub fn pull_request(
        action: PullRequestAction,
        git_ref: impl Into<String>,
        base_ref: impl Into<String>,
    ) -> Self {
        Self {
            git_ref: Some(git_ref.into()),
            event_type: EventType::PullRequest,
            action: Some(action),
            base_ref: Some(base_ref.into()),
            commit: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Value of a filterable field; empty strings count as missing
    pub fn field(&self, field: FilterField) -> Option<&str> {
        let value = match field {
            FilterField::EventType => match self.event_type {
                EventType::Other => None,
                _ => Some(self.event_type.as_str()),
            },
            FilterField::Ref => self.git_ref.as_deref(),
            FilterField::BaseRef => self.base_ref.as_deref(),
            FilterField::Action => match self.action {
                Some(PullRequestAction::Other) | None => None,
                Some(action) => Some(action.as_str()),
            },
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
    #[serde(other)]
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
            EventType::Other => "other",
        }
    }
}

/// Pull-request actions
///
/// Accepts the hosting service's own spellings (`opened`, `synchronize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    #[serde(alias = "opened")]
    Created,
    #[serde(alias = "synchronize")]
    Updated,
    Reopened,
    Closed,
    #[serde(other)]
    Other,
}

impl PullRequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestAction::Created => "created",
            PullRequestAction::Updated => "updated",
            PullRequestAction::Reopened => "reopened",
            PullRequestAction::Closed => "closed",
            PullRequestAction::Other => "other",
        }
    }
}

/// A rule deciding whether an event starts a run
///
/// All clauses must hold for the filter to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub name: String,
    pub entry: EntryPoint,
    pub clauses: Vec<FilterClause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: FilterField,
    pub pattern: FilterPattern,
    /// Inverts the clause; a missing field still fails the clause
    #[serde(default)]
    pub exclude: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    EventType,
    Ref,
    BaseRef,
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPattern {
    Exact(String),
    OneOf(Vec<String>),
    /// Regular expression that must be anchored with `^` and `$`
    Anchored(String),
}

impl TriggerFilter {
    /// Filters derived from the pipeline's integration branch
    pub fn defaults_for(settings: &PipelineSettings) -> Vec<TriggerFilter> {
        let push = TriggerFilter {
            name: PUSH_FILTER.to_string(),
            entry: EntryPoint::Source,
            clauses: vec![
                FilterClause::matching(FilterField::EventType, FilterPattern::Exact("push".into())),
                FilterClause::matching(
                    FilterField::Ref,
                    FilterPattern::Exact(settings.integration_ref()),
                ),
            ],
        };

        let pull_request = TriggerFilter {
            name: PULL_REQUEST_FILTER.to_string(),
            entry: EntryPoint::PullRequestValidation,
            clauses: vec![
                FilterClause::matching(
                    FilterField::EventType,
                    FilterPattern::Exact("pull_request".into()),
                ),
                FilterClause::matching(
                    FilterField::Action,
                    FilterPattern::OneOf(vec![
                        "created".into(),
                        "updated".into(),
                        "reopened".into(),
                    ]),
                ),
                FilterClause::matching(
                    FilterField::BaseRef,
                    FilterPattern::Anchored(format!(
                        "^refs/heads/{}$",
                        regex::escape(&settings.branch)
                    )),
                ),
            ],
        };

        vec![push, pull_request]
    }
}

impl FilterClause {
    pub fn matching(field: FilterField, pattern: FilterPattern) -> Self {
        Self {
            field,
            pattern,
            exclude: false,
        }
    }

    pub fn excluding(field: FilterField, pattern: FilterPattern) -> Self {
        Self {
            field,
            pattern,
            exclude: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push_event() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"ref": "refs/heads/master", "event_type": "push", "commit": "abc123"}"#,
        )
        .unwrap();

        assert_eq!(event.event_type, EventType::Push);
        assert_eq!(event.field(FilterField::Ref), Some("refs/heads/master"));
        assert_eq!(event.field(FilterField::BaseRef), None);
        assert_eq!(event.commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_parse_pull_request_aliases() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"ref": "refs/pull/4/head", "event_type": "pull_request", "action": "opened", "base_ref": "refs/heads/master"}"#,
        )
        .unwrap();
        assert_eq!(event.action, Some(PullRequestAction::Created));

        let event: WebhookEvent = serde_json::from_str(
            r#"{"event_type": "pull_request", "action": "synchronize"}"#,
        )
        .unwrap();
        assert_eq!(event.action, Some(PullRequestAction::Updated));
    }

    #[test]
    fn test_unknown_values_are_not_matchable() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"ref": "", "event_type": "tag_push", "action": "labeled"}"#,
        )
        .unwrap();

        assert_eq!(event.event_type, EventType::Other);
        assert_eq!(event.field(FilterField::EventType), None);
        assert_eq!(event.field(FilterField::Action), None);
        assert_eq!(event.field(FilterField::Ref), None);
    }
}
