//! Credential/role binding
//!
//! Derives one execution role per stage from the resources that stage
//! touches. Every statement names exactly one resource; the only wildcard is
//! template validation, which has no resource-level grain.

use crate::domain::pipeline::{PipelineDefinition, PipelineSettings, StageKind};
use crate::domain::policy::{Principal, PolicyStatement, Role, RoleSet};

/// Resource a stage interacts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchedResource {
    ArtifactPrefix(Access),
    SourceCredential,
    BuildProject,
    BuildLogs,
    Stack,
    TemplateValidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub struct RoleBinder;

impl RoleBinder {
    /// Resources each stage needs, nothing more
    pub fn touch_set(kind: StageKind) -> &'static [TouchedResource] {
        use TouchedResource::*;
        match kind {
            StageKind::Source => &[ArtifactPrefix(Access::Write), SourceCredential],
            StageKind::Test => &[ArtifactPrefix(Access::Read), BuildProject, BuildLogs],
            StageKind::Deploy => &[ArtifactPrefix(Access::Read), Stack, TemplateValidation],
        }
    }

    pub fn bind(definition: &PipelineDefinition) -> RoleSet {
        let role = |kind| Self::role_for(definition, kind);
        RoleSet {
            source: role(StageKind::Source),
            test: role(StageKind::Test),
            deploy: role(StageKind::Deploy),
        }
    }

    fn role_for(definition: &PipelineDefinition, kind: StageKind) -> Role {
        let settings = &definition.settings;
        let statements = Self::touch_set(kind)
            .iter()
            .map(|resource| statement(definition, settings, *resource))
            .collect();

        let role = Role {
            name: format!("{}-{}-role", definition.name, kind),
            stage: kind,
            principal: Principal::Service(service_principal(kind).to_string()),
            statements,
        };
        debug_assert!(role.scope_violations().is_empty());
        role
    }
}

fn service_principal(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Source => "codepipeline.amazonaws.com",
        StageKind::Test => "codebuild.amazonaws.com",
        StageKind::Deploy => "cloudformation.amazonaws.com",
    }
}

fn statement(
    definition: &PipelineDefinition,
    settings: &PipelineSettings,
    resource: TouchedResource,
) -> PolicyStatement {
    let p = &settings.partition;
    let region = &settings.region;
    let account = &settings.account_id;

    match resource {
        TouchedResource::ArtifactPrefix(access) => {
            let arn = format!(
                "arn:{}:s3:::{}/{}/*",
                p, settings.artifact_bucket, definition.name
            );
            match access {
                Access::Read => {
                    PolicyStatement::allow(&["s3:GetObject", "s3:GetObjectVersion"], arn)
                }
                Access::Write => PolicyStatement::allow(
                    &["s3:PutObject", "s3:GetObject", "s3:GetObjectVersion"],
                    arn,
                ),
            }
        }
        TouchedResource::SourceCredential => PolicyStatement::allow(
            &["secretsmanager:GetSecretValue"],
            format!(
                "arn:{}:secretsmanager:{}:{}:secret:{}/source-credential",
                p, region, account, definition.name
            ),
        ),
        TouchedResource::BuildProject => PolicyStatement::allow(
            &["codebuild:StartBuild", "codebuild:BatchGetBuilds"],
            format!(
                "arn:{}:codebuild:{}:{}:project/{}",
                p, region, account, settings.build_project
            ),
        ),
        TouchedResource::BuildLogs => PolicyStatement::allow(
            &["logs:CreateLogStream", "logs:PutLogEvents"],
            format!(
                "arn:{}:logs:{}:{}:log-group:/aws/codebuild/{}",
                p, region, account, settings.build_project
            ),
        ),
        TouchedResource::Stack => PolicyStatement::allow(
            &[
                "cloudformation:DescribeStacks",
                "cloudformation:CreateStack",
                "cloudformation:UpdateStack",
                "cloudformation:CreateChangeSet",
                "cloudformation:DescribeChangeSet",
                "cloudformation:ExecuteChangeSet",
            ],
            format!(
                "arn:{}:cloudformation:{}:{}:stack/{}/*",
                p, region, account, settings.stack_name
            ),
        ),
        TouchedResource::TemplateValidation => {
            PolicyStatement::allow(&["cloudformation:ValidateTemplate"], "*")
        }
    }
}
