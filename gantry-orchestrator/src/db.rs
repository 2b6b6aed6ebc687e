use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Runs; stage records, trigger and failure are stored as JSON documents
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id BIGSERIAL PRIMARY KEY,
            pipeline VARCHAR(255) NOT NULL,
            entry VARCHAR(50) NOT NULL,
            trigger JSONB NOT NULL,
            state VARCHAR(50) NOT NULL,
            stages JSONB NOT NULL DEFAULT '[]',
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            failure JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    // Singleton resources; a row is claimed before the resource is provisioned
    // and the primary key lets exactly one claim win
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS singleton_resources (
            kind VARCHAR(100) NOT NULL,
            scope VARCHAR(255) NOT NULL,
            state JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (kind, scope)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
