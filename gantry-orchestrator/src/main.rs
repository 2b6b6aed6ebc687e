use anyhow::Context;
use gantry_core::domain::pipeline::PipelineDefinition;
use gantry_runner::{
    CloudFormationCliEngine, FsArtifactStore, GitHubClient, GitHubStatusReporter,
    GitSourceFetcher, PodmanValidationEnvironment, StandardStageExecutor,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::OrchestratorConfig;
use crate::repository::{
    InMemoryRunRepository, InMemorySingletonStore, PgRunRepository, PgSingletonStore,
    RunRepository, SingletonStore,
};
use crate::service::{
    ExternallyManaged, GitHubWebhookRegistrar, PipelineController, SingletonGuard,
    SingletonProvisioner,
};

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gantry_orchestrator=debug,gantry_runner=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Gantry Orchestrator...");

    let config = OrchestratorConfig::from_env()?;

    let definition = PipelineDefinition::load(&config.pipeline_definition).with_context(|| {
        format!(
            "Failed to load pipeline definition {}",
            config.pipeline_definition.display()
        )
    })?;
    let definition = Arc::new(definition);
    let settings = &definition.settings;

    tracing::info!(
        "Loaded pipeline '{}' for {} ({} stages)",
        definition.name,
        settings.repository(),
        definition.stages.len()
    );

    // Storage
    let (runs, singletons): (Arc<dyn RunRepository>, Arc<dyn SingletonStore>) =
        match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to database...");
                let pool = db::create_pool(url)
                    .await
                    .context("Failed to create database pool")?;
                db::run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                (
                    Arc::new(PgRunRepository::new(pool.clone())),
                    Arc::new(PgSingletonStore::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, run history is kept in memory only");
                (
                    Arc::new(InMemoryRunRepository::new()),
                    Arc::new(InMemorySingletonStore::new()),
                )
            }
        };

    // Collaborators
    let github = GitHubClient::new(
        config.executor.github_api_url.clone(),
        settings.source_credential.clone(),
    );

    let provisioner: Arc<dyn SingletonProvisioner> = if settings.create_webhook_credential {
        let url = config
            .public_webhook_url
            .clone()
            .context("PUBLIC_WEBHOOK_URL is required when create_webhook_credential is true")?;
        Arc::new(GitHubWebhookRegistrar::new(
            github.clone(),
            settings.repository(),
            url,
            config.webhook_secret.clone(),
        ))
    } else {
        Arc::new(ExternallyManaged)
    };
    let guard = Arc::new(SingletonGuard::new(singletons, provisioner));

    let executor = StandardStageExecutor::new(
        settings.clone(),
        config.executor.clone(),
        Arc::new(FsArtifactStore::new(config.executor.artifact_root.clone())),
        Arc::new(GitSourceFetcher::new(config.executor.git_host.clone())),
        Arc::new(PodmanValidationEnvironment::new()),
        Arc::new(CloudFormationCliEngine::new(config.executor.deploy_cli.clone())),
    )
    .with_status_reporter(Arc::new(GitHubStatusReporter::new(github)));

    let controller = PipelineController::new(
        definition.clone(),
        runs,
        Arc::new(executor),
        guard,
        config.executor.workspace_base.clone(),
    )
    .context("Invalid trigger configuration")?;
    let controller = Arc::new(controller);

    // Runs left unfinished by a previous process are reported, never resumed
    for run in controller.abandoned_runs().await? {
        tracing::warn!(
            "Run {} was left in state {:?}; cancel it with POST /runs/{}/cancel",
            run.id,
            run.state,
            run.id
        );
    }

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        controller,
        webhook_secret: config.webhook_secret.clone(),
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
