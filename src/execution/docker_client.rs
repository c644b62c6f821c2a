//! Docker API wrapper using the bollard crate.
//!
//! Covers the container lifecycle the cookiecutter templater needs: make
//! sure the image is present, run a one-shot container with bind mounts,
//! follow its output and collect the exit code.

use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::DockerError;

/// A one-shot container: image, command and bind mounts.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub network_mode: String,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            binds: Vec::new(),
            network_mode: "bridge".to_string(),
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_volume(mut self, host: &str, container: &str) -> Self {
        self.binds.push(format!("{host}:{container}"));
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }
}

/// Docker client wrapper for container operations.
///
/// Cheap to share behind an `Arc`; bollard's client is internally
/// reference counted and safe to use from many tasks at once.
pub struct DockerClient {
    docker: Docker,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient").finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Creates a client for the local Docker daemon.
    ///
    /// Connecting is lazy; use [`ping`](Self::ping) to check the daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if no connection can be configured.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Pulls `image` unless it is already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if self.image_exists(image).await {
            debug!(image = %image, "Image already present");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed(format!("{image}: {e}")))?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Creates the container and returns its id.
    pub async fn create_container(&self, config: ContainerConfig) -> Result<String, DockerError> {
        let ContainerConfig {
            name,
            image,
            cmd,
            binds,
            network_mode,
        } = config;

        let body = Config {
            image: Some(image),
            cmd,
            host_config: Some(HostConfig {
                network_mode: Some(network_mode),
                binds: (!binds.is_empty()).then_some(binds),
                ..Default::default()
            }),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                body,
            )
            .await
            .map_err(|e| DockerError::RunFailed(format!("create: {e}")))?;

        debug!(container_id = %created.id, "Container created");
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("start {id}: {e}")))
    }

    /// Follows a container's combined stdout and stderr until it exits.
    ///
    /// Each item is one output chunk, which may hold several lines.
    pub fn follow_logs(&self, id: &str) -> impl Stream<Item = Result<String, DockerError>> + '_ {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        self.docker.logs(id, Some(options)).map(|chunk| match chunk {
            Ok(LogOutput::StdOut { message })
            | Ok(LogOutput::StdErr { message })
            | Ok(LogOutput::Console { message }) => {
                Ok(String::from_utf8_lossy(&message).into_owned())
            }
            Ok(_) => Ok(String::new()),
            Err(e) => Err(DockerError::RunFailed(format!("Error reading logs: {e}"))),
        })
    }

    /// Blocks until the container stops; returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DockerError::RunFailed(format!("wait {id}: {e}"))),
            None => self.exit_code(id).await,
        }
    }

    async fn exit_code(&self, id: &str) -> Result<i64, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to inspect container: {e}"))
                }
            })?;

        info.state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| DockerError::RunFailed("Container did not exit normally".to_string()))
    }

    /// Whether the daemon still knows a container with this id.
    pub async fn container_exists(&self, id: &str) -> bool {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .is_ok()
    }

    /// Removes the container and its anonymous volumes.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| DockerError::RunFailed(format!("remove {id}: {e}")))
    }
}

/// Owns a created container and force-removes it when dropped.
///
/// A run future can be dropped at any await point, for example by a stage
/// timeout; the guard then removes the container on a spawned task.
#[derive(Debug)]
pub struct ContainerGuard {
    client: Arc<DockerClient>,
    id: Option<String>,
}

impl ContainerGuard {
    pub fn new(client: Arc<DockerClient>, id: impl Into<String>) -> Self {
        Self {
            client,
            id: Some(id.into()),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Removes the container now; the guard has nothing left to do on drop.
    pub async fn remove(mut self) -> Result<(), DockerError> {
        match self.id.take() {
            Some(id) => self.client.remove_container(&id, true).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %id, "No runtime left to remove container");
            return;
        };

        warn!(container_id = %id, "Container run interrupted, removing container");
        let client = Arc::clone(&self.client);
        runtime.spawn(async move {
            if let Err(e) = client.remove_container(&id, true).await {
                warn!(container_id = %id, error = %e, "Failed to remove container");
            }
        });
    }
}
