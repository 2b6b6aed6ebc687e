//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::{EntryPoint, Run, RunFailure, RunId, RunState};

/// Summary information about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub pipeline: String,
    pub entry: EntryPoint,
    pub state: RunState,

    /// Ref the run was started for
    pub git_ref: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Failure detail for failed runs
    pub failure: Option<RunFailure>,
}

impl From<Run> for RunSummary {
    fn from(run: Run) -> Self {
        RunSummary {
            id: run.id,
            pipeline: run.pipeline,
            entry: run.entry,
            state: run.state,
            git_ref: run.trigger.git_ref,
            started_at: run.started_at,
            finished_at: run.finished_at,
            failure: run.failure,
        }
    }
}

/// Query parameters of `GET /runs`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRuns {
    pub limit: Option<i64>,
}
