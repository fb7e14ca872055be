//! Podman container management
//!
//! Steps that name an image run inside a container. One container per image
//! is started lazily for a stage, with the stage workspace mounted, and every
//! command of those steps is executed in it through `podman exec`.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mount point of the stage workspace inside containers
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());
    Ok(())
}

/// Containers of one stage, keyed by image
pub struct ContainerManager {
    stage_id: Uuid,
    workspace: PathBuf,
    /// image -> container name
    containers: Mutex<HashMap<String, String>>,
}

impl ContainerManager {
    pub fn new(stage_id: Uuid, workspace: impl Into<PathBuf>) -> Self {
        Self {
            stage_id,
            workspace: workspace.into(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a container for the given image is running and returns its name
    pub async fn ensure_running(&self, image: &str) -> Result<String> {
        let mut containers = self.containers.lock().await;
        if let Some(name) = containers.get(image) {
            return Ok(name.clone());
        }

        let name = container_name(self.stage_id, image);
        info!("Creating container {} for image {}", name, image);

        // The entrypoint is overridden so images with custom entrypoints stay idle
        let output = Command::new("podman")
            .arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&name)
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!("{}:{}", self.workspace.display(), CONTAINER_WORKSPACE))
            .arg("-w")
            .arg(CONTAINER_WORKSPACE)
            .arg(image)
            .arg("-c")
            .arg("sleep infinity")
            .output()
            .await
            .context("Failed to execute podman run command")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to start container for image {}: exit_code={}, stderr='{}'",
                image,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(
            "Container {} started with ID {}",
            name,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        containers.insert(image.to_string(), name.clone());
        Ok(name)
    }

    /// A `podman exec` command running `script` through the container shell
    pub fn exec_command(
        container: &str,
        script: &str,
        env: &HashMap<String, String>,
    ) -> Command {
        let mut command = Command::new("podman");
        command.arg("exec").arg("-w").arg(CONTAINER_WORKSPACE);
        for (key, value) in env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(container).arg("/bin/sh").arg("-c").arg(script);
        command
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Stops and removes every container of the stage
    pub async fn cleanup(&self) {
        let mut containers = self.containers.lock().await;
        if containers.is_empty() {
            return;
        }
        info!(
            "Cleaning up {} container(s) for stage {}",
            containers.len(),
            self.stage_id
        );

        for (image, name) in containers.drain() {
            debug!("Removing container {} (image: {})", name, image);
            match Command::new("podman")
                .arg("rm")
                .arg("-f")
                .arg(&name)
                .output()
                .await
            {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    "Failed to remove container {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Failed to remove container {}: {}", name, e),
            }
        }
    }
}

/// Stable container name for a stage and image
fn container_name(stage_id: Uuid, image: &str) -> String {
    let mut hasher = DefaultHasher::new();
    image.hash(&mut hasher);
    format!("gantry-{}-{:x}", stage_id, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_names_are_per_stage_and_image() {
        let stage = Uuid::new_v4();
        let a = container_name(stage, "alpine:3");
        assert_eq!(a, container_name(stage, "alpine:3"));
        assert_ne!(a, container_name(stage, "rust:1"));
        assert_ne!(a, container_name(Uuid::new_v4(), "alpine:3"));
        assert!(a.starts_with(&format!("gantry-{}-", stage)));
    }

    #[test]
    fn test_exec_command_passes_env_and_script() {
        let env = HashMap::from([("TARGET".to_string(), "prod".to_string())]);
        let command = ContainerManager::exec_command("c1", "make test", &env);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["exec", "-w", "/workspace", "-e", "TARGET=prod", "c1", "/bin/sh", "-c", "make test"]
        );
    }
}
