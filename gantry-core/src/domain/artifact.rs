//! Artifact domain types

use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;

/// Reference to one immutable version of a named artifact
///
/// Downstream stages receive references; the stored content is never
/// rewritten, every producing run creates a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub version: u64,
    /// Hex-encoded SHA-256 over the artifact content
    pub digest: String,
    /// Name of the stage that produced this version
    pub producer: String,
    pub run_id: RunId,
    /// Store-specific location of the content
    pub location: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = &self.digest[..self.digest.len().min(12)];
        write!(f, "{}@v{} ({})", self.name, self.version, short)
    }
}
