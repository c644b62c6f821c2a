//! Docker execution layer used by container-based templaters.
//!
//! Wraps the bollard crate. The client is shared across task executions and
//! handed to stages through the stage context.
//!
//! # Example
//!
//! ```ignore
//! use scaffolder::execution::{ContainerConfig, DockerClient};
//!
//! let client = DockerClient::new()?;
//! client.ensure_image("spotify/backstage-cookiecutter").await?;
//!
//! let config = ContainerConfig::new("cookiecutter-123", "spotify/backstage-cookiecutter")
//!     .with_volume("/tmp/skeleton", "/input");
//! let id = client.create_container(config).await?;
//! client.start_container(&id).await?;
//! let exit_code = client.wait_container(&id).await?;
//! client.remove_container(&id, true).await?;
//! ```

pub mod docker_client;

pub use docker_client::{ContainerConfig, ContainerGuard, DockerClient};
