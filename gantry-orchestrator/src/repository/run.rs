//! Run Repository
//!
//! Persists runs together with their per-stage records. Every state
//! transition of the controller is written through `save`.

use async_trait::async_trait;
use gantry_core::domain::run::{EntryPoint, NewRun, Run, RunFailure, RunId, RunState, StageRecord, TriggerContext};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::repository::RepositoryError;

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Persists a new run and assigns its identifier
    async fn create(&self, new_run: NewRun) -> Result<Run, RepositoryError>;

    /// Overwrites the mutable part of a run: state, stages, finish time and failure
    async fn save(&self, run: &Run) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError>;

    /// Most recently started runs first
    async fn list_recent(&self, limit: i64) -> Result<Vec<Run>, RepositoryError>;

    /// Runs not yet in a terminal state
    async fn find_unfinished(&self) -> Result<Vec<Run>, RepositoryError>;
}

pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TERMINAL_STATES: [&str; 3] = ["Succeeded", "Failed", "Cancelled"];

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create(&self, new_run: NewRun) -> Result<Run, RepositoryError> {
        let mut run = new_run.into_run(0);

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO runs (pipeline, entry, trigger, state, stages, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&run.pipeline)
        .bind(run.entry.as_str())
        .bind(to_json(&run.trigger)?)
        .bind(run.state.as_str())
        .bind(to_json(&run.stages)?)
        .bind(run.started_at)
        .fetch_one(&self.pool)
        .await?;

        run.id = id;
        Ok(run)
    }

    async fn save(&self, run: &Run) -> Result<(), RepositoryError> {
        let failure = run.failure.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = $1, stages = $2, finished_at = $3, failure = $4
            WHERE id = $5
            "#,
        )
        .bind(run.state.as_str())
        .bind(to_json(&run.stages)?)
        .bind(run.finished_at)
        .bind(failure)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(run.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline, entry, trigger, state, stages, started_at, finished_at, failure
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline, entry, trigger, state, stages, started_at, finished_at, failure
            FROM runs
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn find_unfinished(&self) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline, entry, trigger, state, stages, started_at, finished_at, failure
            FROM runs
            WHERE state <> ALL($1)
            ORDER BY id ASC
            "#,
        )
        .bind(&TERMINAL_STATES[..])
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }
}

/// Internal row type for database queries
#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    pipeline: String,
    entry: String,
    trigger: JsonValue,
    state: String,
    stages: JsonValue,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    failure: Option<JsonValue>,
}

impl TryFrom<RunRow> for Run {
    type Error = RepositoryError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let entry = EntryPoint::parse(&row.entry).ok_or_else(|| {
            RepositoryError::Corrupt(format!("run {} has unknown entry '{}'", row.id, row.entry))
        })?;
        let state = RunState::parse(&row.state).ok_or_else(|| {
            RepositoryError::Corrupt(format!("run {} has unknown state '{}'", row.id, row.state))
        })?;

        let trigger: TriggerContext = from_json(row.id, row.trigger)?;
        let stages: Vec<StageRecord> = from_json(row.id, row.stages)?;
        let failure: Option<RunFailure> = row.failure.map(|f| from_json(row.id, f)).transpose()?;

        Ok(Run {
            id: row.id,
            pipeline: row.pipeline,
            entry,
            trigger,
            state,
            stages,
            started_at: row.started_at,
            finished_at: row.finished_at,
            failure,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, RepositoryError> {
    serde_json::to_value(value).map_err(|e| RepositoryError::Corrupt(e.to_string()))
}

fn from_json<T: DeserializeOwned>(id: RunId, value: JsonValue) -> Result<T, RepositoryError> {
    serde_json::from_value(value)
        .map_err(|e| RepositoryError::Corrupt(format!("run {}: {}", id, e)))
}

/// In-memory run repository with an atomic id counter
pub struct InMemoryRunRepository {
    runs: RwLock<BTreeMap<RunId, Run>>,
    next_id: AtomicI64,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create(&self, new_run: NewRun) -> Result<Run, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let run = new_run.into_run(id);
        self.runs.write().await.insert(id, run.clone());
        Ok(run)
    }

    async fn save(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(&run.id)
            .ok_or(RepositoryError::NotFound(run.id))?;
        *stored = run.clone();
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Run>, RepositoryError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .runs
            .read()
            .await
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_unfinished(&self) -> Result<Vec<Run>, RepositoryError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::domain::pipeline::StageKind;
    use gantry_core::domain::trigger::EventType;

    fn new_run() -> NewRun {
        NewRun {
            pipeline: "infra-pipeline".to_string(),
            entry: EntryPoint::Source,
            trigger: TriggerContext {
                event_type: EventType::Push,
                git_ref: "refs/heads/master".to_string(),
                commit: None,
                base_ref: None,
                filter: "push-to-integration-branch".to_string(),
            },
            stages: vec![StageRecord::pending("Source", StageKind::Source)],
        }
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let repo = InMemoryRunRepository::new();
        let first = repo.create(new_run()).await.unwrap();
        let second = repo.create(new_run()).await.unwrap();
        assert!(second.id > first.id);

        let recent = repo.list_recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);
    }

    #[tokio::test]
    async fn test_save_and_unfinished() {
        let repo = InMemoryRunRepository::new();
        let mut run = repo.create(new_run()).await.unwrap();
        assert_eq!(repo.find_unfinished().await.unwrap().len(), 1);

        run.finish(RunState::Succeeded, None);
        repo.save(&run).await.unwrap();

        let stored = repo.find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Succeeded);
        assert!(stored.finished_at.is_some());
        assert!(repo.find_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_unknown_run() {
        let repo = InMemoryRunRepository::new();
        let run = new_run().into_run(99);
        assert!(matches!(
            repo.save(&run).await,
            Err(RepositoryError::NotFound(99))
        ));
    }

    #[test]
    fn test_row_with_unknown_state_is_corrupt() {
        let run = new_run().into_run(5);
        let row = RunRow {
            id: 5,
            pipeline: run.pipeline.clone(),
            entry: "source".to_string(),
            trigger: serde_json::to_value(&run.trigger).unwrap(),
            state: "Exploded".to_string(),
            stages: serde_json::to_value(&run.stages).unwrap(),
            started_at: run.started_at,
            finished_at: None,
            failure: None,
        };
        assert!(matches!(Run::try_from(row), Err(RepositoryError::Corrupt(_))));
    }

    #[test]
    fn test_row_conversion() {
        let run = new_run().into_run(5);
        let row = RunRow {
            id: 5,
            pipeline: run.pipeline.clone(),
            entry: run.entry.as_str().to_string(),
            trigger: serde_json::to_value(&run.trigger).unwrap(),
            state: "TestDone".to_string(),
            stages: serde_json::to_value(&run.stages).unwrap(),
            started_at: run.started_at,
            finished_at: None,
            failure: None,
        };
        let converted = Run::try_from(row).unwrap();
        assert_eq!(converted.state, RunState::TestDone);
        assert_eq!(converted.stages.len(), 1);
        assert_eq!(converted.trigger.git_ref, "refs/heads/master");
    }
}
