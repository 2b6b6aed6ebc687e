//! Role and policy domain types

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::StageKind;

/// Actions that have no resource-level grain and may use `*`
pub const ACCOUNT_WIDE_ACTIONS: &[&str] = &["cloudformation:ValidateTemplate"];

/// Execution identity of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub stage: StageKind,
    pub principal: Principal,
    pub statements: Vec<PolicyStatement>,
}

impl Role {
    /// Identifier the deployment engine assumes
    pub fn arn(&self, partition: &str, account_id: &str) -> String {
        format!("arn:{}:iam::{}:role/{}", partition, account_id, self.name)
    }

    /// All actions granted to this role on the given resource
    pub fn actions_on(&self, resource: &str) -> Vec<&str> {
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow && s.resource == resource)
            .flat_map(|s| s.actions.iter().map(String::as_str))
            .collect()
    }

    /// Statements that grant a wildcard resource for actions with a narrower grain
    pub fn scope_violations(&self) -> Vec<&PolicyStatement> {
        self.statements
            .iter()
            .filter(|s| s.resource_is_wildcard())
            .filter(|s| {
                s.actions
                    .iter()
                    .any(|a| !ACCOUNT_WIDE_ACTIONS.contains(&a.as_str()))
            })
            .collect()
    }
}

/// The principal allowed to assume a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    Service(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// (effect, actions, resource) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub effect: Effect,
    pub actions: Vec<String>,
    pub resource: String,
}

impl PolicyStatement {
    pub fn allow(actions: &[&str], resource: impl Into<String>) -> Self {
        Self {
            effect: Effect::Allow,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resource: resource.into(),
        }
    }

    /// True unless the only `*` is a trailing `/*` below a concrete identifier
    pub fn resource_is_wildcard(&self) -> bool {
        let resource = self.resource.as_str();
        let scoped = resource.strip_suffix("/*").unwrap_or(resource);
        scoped.is_empty() || scoped.contains('*') || scoped.ends_with('/') || scoped.ends_with(':')
    }
}

/// Roles of all three stages of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    pub source: Role,
    pub test: Role,
    pub deploy: Role,
}

impl RoleSet {
    pub fn for_stage(&self, kind: StageKind) -> &Role {
        match kind {
            StageKind::Source => &self.source,
            StageKind::Test => &self.test,
            StageKind::Deploy => &self.deploy,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        [&self.source, &self.test, &self.deploy].into_iter()
    }
}
