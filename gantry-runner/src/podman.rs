//! Podman validation environment
//!
//! Runs validation commands in a throwaway container with the artifact
//! mounted at `/workspace`. The container is removed when the run finishes
//! or, if the stage is cancelled mid-run, when its guard is dropped.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::process;
use crate::validation::{ValidationEnvironment, ValidationReport, ValidationRequest};

/// Exit code podman uses for its own failures, as opposed to the container's
const PODMAN_ERROR_EXIT: i32 = 125;

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<String, StageError> {
    let output = process::run(process::command("podman").arg("--version"))
        .await
        .map_err(|e| {
            StageError::Environment(format!(
                "failed to execute 'podman --version', is podman installed? {}",
                e
            ))
        })?;

    if !output.success() {
        return Err(StageError::Environment(
            "podman is not working correctly".to_string(),
        ));
    }

    let version = output.stdout.trim().to_string();
    info!("Podman is available: {}", version);
    Ok(version)
}

pub struct PodmanValidationEnvironment {
    prefix: String,
}

impl PodmanValidationEnvironment {
    pub fn new() -> Self {
        Self {
            prefix: "gantry".to_string(),
        }
    }

    fn container_name(&self, request: &ValidationRequest) -> String {
        format!("{}-{}", self.prefix, request.label)
    }
}

impl Default for PodmanValidationEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValidationEnvironment for PodmanValidationEnvironment {
    async fn run(&self, request: &ValidationRequest) -> Result<ValidationReport, StageError> {
        let name = self.container_name(request);
        let mut guard = ContainerGuard::new(name.clone());

        info!(
            "Starting validation container {} with image {}",
            name, request.image
        );

        let output = process::run(
            process::command("podman")
                .arg("run")
                .arg("--rm")
                .arg("--name")
                .arg(&name)
                .arg("--entrypoint")
                .arg("/bin/sh")
                .arg("-v")
                .arg(format!("{}:/workspace:Z", request.workdir.display()))
                .arg("-w")
                .arg("/workspace")
                .arg(&request.image)
                .arg("-c")
                .arg(request.script()),
        )
        .await
        .map_err(|e| StageError::Environment(format!("failed to execute podman run: {}", e)))?;

        guard.disarm();

        if is_podman_failure(output.exit_code, &output.stderr) {
            return Err(StageError::Environment(format!(
                "podman could not start container for image {}: {}",
                request.image,
                output.diagnostic()
            )));
        }

        debug!(
            "Validation container {} exited with {:?}",
            name, output.exit_code
        );

        Ok(ValidationReport {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Podman exits 125 with a final `Error: ...` line when it cannot start the
/// container; a script exiting 125 on its own is an ordinary validation failure
fn is_podman_failure(exit_code: Option<i32>, stderr: &str) -> bool {
    exit_code == Some(PODMAN_ERROR_EXIT)
        && stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .is_some_and(|line| line.starts_with("Error: "))
}

/// Force-removes the container if the run future is dropped before it exits
struct ContainerGuard {
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(name: String) -> Self {
        Self { name, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Removing abandoned validation container {}", self.name);
        let removal = std::process::Command::new("podman")
            .args(["rm", "-f", &self.name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        if let Err(e) = removal {
            warn!("Failed to remove container {}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_container_name() {
        let env = PodmanValidationEnvironment::new();
        let request = ValidationRequest {
            label: "run-7-ValidateTemplate".to_string(),
            image: "alpine:3".to_string(),
            commands: vec!["true".to_string()],
            workdir: PathBuf::from("/ws"),
        };
        assert_eq!(env.container_name(&request), "gantry-run-7-ValidateTemplate");
    }

    #[test]
    fn test_exit_125_from_the_script_is_not_an_environment_error() {
        let pull_failure = "Trying to pull docker.io/library/nope:3...\n\
            Error: initializing source docker://nope:3: reading manifest 3: manifest unknown\n";
        assert!(is_podman_failure(Some(125), pull_failure));

        assert!(!is_podman_failure(Some(125), "E3001 Invalid resource\n"));
        assert!(!is_podman_failure(Some(125), ""));
        assert!(!is_podman_failure(Some(1), "Error: something\n"));
        assert!(!is_podman_failure(None, "Error: something\n"));
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let mut guard = ContainerGuard::new("gantry-test".to_string());
        guard.disarm();
        assert!(!guard.armed);
    }
}
