//! Execution context for pipeline stages
//!
//! Contains all state needed while one stage executes:
//! - Run identity and the trigger that started the run
//! - Workspace directory for the stage's actions
//! - Log buffer, persisted on the stage record afterwards
//! - Cancellation token shared with the controller

use gantry_core::domain::log::{LogEntry, LogLevel};
use gantry_core::domain::run::{EntryPoint, RunId, TriggerContext};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct StageContext {
    pub run_id: RunId,
    pub entry: EntryPoint,
    pub trigger: TriggerContext,
    pub stage: String,

    /// Working tree shared by the stage's actions
    workspace: PathBuf,

    log_buffer: Mutex<Vec<LogEntry>>,

    /// Cancelled when the operator aborts the run
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Creates a new stage context
    ///
    /// # Arguments
    /// * `run_id` - The run ID
    /// * `entry` - Entry point the run was started through
    /// * `trigger` - What started the run
    /// * `stage` - Name of the stage being executed
    /// * `workspace_base` - Base directory for workspaces
    /// * `cancel` - The run's cancellation token
    pub fn new(
        run_id: RunId,
        entry: EntryPoint,
        trigger: TriggerContext,
        stage: &str,
        workspace_base: &Path,
        cancel: CancellationToken,
    ) -> Self {
        let workspace = workspace_base
            .join(format!("run-{}", run_id))
            .join(sanitize(stage));

        Self {
            run_id,
            entry,
            trigger,
            stage: stage.to_string(),
            workspace,
            log_buffer: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Name for an isolated environment running one of this stage's actions
    pub fn environment_label(&self, action: &str) -> String {
        format!("run-{}-{}-{}", self.run_id, sanitize(&self.stage), sanitize(action))
    }

    pub fn add_log(&self, entry: LogEntry) {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(entry);
    }

    pub fn log_debug(&self, message: impl Into<String>) {
        self.add_log(LogEntry::new(LogLevel::Debug, message));
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.add_log(LogEntry::new(LogLevel::Info, message));
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.add_log(LogEntry::new(LogLevel::Warning, message));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.add_log(LogEntry::new(LogLevel::Error, message));
    }

    /// Logs every non-empty line of a process output stream
    pub fn log_output(&self, level: LogLevel, output: &str) {
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            self.add_log(LogEntry::new(level, line));
        }
    }

    /// Returns all buffered entries and clears the buffer
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.drain(..).collect()
    }
}

/// Keeps names usable as single path components
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
