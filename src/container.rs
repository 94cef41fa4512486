// Thin wrapper around the `docker` CLI: image existence checks, builds, and
// running/terminating client containers. The container engine itself is an
// external collaborator; this module only shells out to it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{ArenaError, TransientError};

pub fn image_tag(submission_id: i64) -> String {
    format!("submission_{submission_id}")
}

/// True if an image with this tag already exists locally.
pub async fn image_exists(tag: &str) -> Result<bool, ArenaError> {
    let output = Command::new("docker")
        .args(["image", "inspect", tag])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(TransientError::from)?;
    Ok(output.success())
}

/// Build an image from `context_dir`, teeing combined stdout+stderr to
/// `log_path`. Returns an error only if the process could not be spawned;
/// callers check `image_exists` afterwards to decide success.
pub async fn build_image(tag: &str, context_dir: &Path, log_path: &Path) -> Result<(), ArenaError> {
    info!(tag, dir = %context_dir.display(), "building submission image");
    let output = Command::new("docker")
        .args(["build", "-t", tag, "."])
        .current_dir(context_dir)
        .output()
        .await
        .map_err(TransientError::from)?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    tokio::fs::write(log_path, &combined)
        .await
        .map_err(|e| ArenaError::Transient(TransientError::from(e)))?;

    if !output.status.success() {
        warn!(tag, "docker build exited with failure status");
    }
    Ok(())
}

/// Parameters for launching one side of a match.
pub struct RunSpec<'a> {
    pub container_name: &'a str,
    pub image_tag: &'a str,
    pub cpu: &'a str,
    pub ram: &'a str,
    pub args: Vec<String>,
    pub stdout_path: &'a Path,
}

/// A running client container; dropping this does NOT stop the container —
/// callers must call `terminate_and_wait` on every exit path.
pub struct RunningContainer {
    pub name: String,
    child: Option<Child>,
    log_file: Option<tokio::fs::File>,
}

pub async fn run_client(spec: RunSpec<'_>) -> Result<RunningContainer, ArenaError> {
    let log_file = tokio::fs::File::create(spec.stdout_path)
        .await
        .map_err(|e| ArenaError::Transient(TransientError::from(e)))?;
    let std_file = log_file
        .try_clone()
        .await
        .map_err(|e| ArenaError::Transient(TransientError::from(e)))?
        .into_std()
        .await;
    let stdout_handle = std_file.try_clone().map_err(|e| ArenaError::Transient(TransientError::from(e)))?;
    let stderr_handle = std_file;

    let mut command = Command::new("docker");
    command
        .arg("run")
        .arg("--rm")
        .arg("--name")
        .arg(spec.container_name)
        .arg("--network")
        .arg("host")
        .arg("--memory-swap")
        .arg(spec.ram)
        .arg("--memory")
        .arg(spec.ram)
        .arg("--cpus")
        .arg(spec.cpu)
        .arg(spec.image_tag)
        .args(&spec.args)
        .stdout(Stdio::from(stdout_handle))
        .stderr(Stdio::from(stderr_handle));

    // Detach into its own process group so signals sent to the runner
    // (e.g. Ctrl-C) are not propagated to the docker client process.
    #[cfg(unix)]
    command.process_group(0);

    debug!(name = spec.container_name, "launching client container");
    let child = command.spawn().map_err(TransientError::from)?;

    Ok(RunningContainer {
        name: spec.container_name.to_string(),
        child: Some(child),
        log_file: Some(log_file),
    })
}

impl RunningContainer {
    /// Non-blocking check of whether the process has exited.
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>, ArenaError> {
        match &mut self.child {
            Some(child) => child.try_wait().map_err(|e| ArenaError::Transient(TransientError::from(e))),
            None => Ok(None),
        }
    }

    /// Send a terminate signal to the container (docker stop), wait a short
    /// grace period, then make sure the process handle and log file are
    /// released. Safe to call more than once and on an already-exited child.
    pub async fn terminate_and_wait(&mut self, grace: Duration) {
        let _ = Command::new("docker")
            .args(["stop", "--time", &grace.as_secs().to_string(), &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(name = self.name, "container did not stop within grace period, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(mut file) = self.log_file.take() {
            let _ = file.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_format() {
        assert_eq!(image_tag(42), "submission_42");
    }
}
