//! Container runtime access
//!
//! The deploy talks to containers only through [`ContainerRuntime`], and
//! obtains runtimes for a named machine through [`RuntimeConnector`].

pub mod config;
pub mod docker;
pub mod filter;

pub use config::{ContainerInfo, ListFilter, PublishedPort, RestartPolicy, RunConfig};
pub use docker::{DockerEngine, EngineConnector, EngineEndpoint};
pub use filter::FilterChain;

use crate::error::{ArmadaError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations on the containers of one engine or swarm
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers, running or not
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerInfo>>;

    /// Look up one container by ID
    async fn get(&self, id: &str) -> Result<ContainerInfo> {
        self.list(&ListFilter::all())
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ArmadaError::ContainerNotFound(id.to_string()))
    }

    /// Create a container and return its ID
    async fn create(&self, config: &RunConfig) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed
    async fn remove(&self, id: &str) -> Result<()>;

    /// Create and start a container
    async fn run(&self, config: &RunConfig) -> Result<String> {
        let id = self.create(config).await?;
        tracing::debug!("Container {} created as {}", config.name, id);
        self.start(&id).await?;
        Ok(id)
    }
}

/// Opens a runtime for a machine
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    /// Connect to `machine`, through its swarm endpoint when `swarm` is set
    async fn connect(&self, machine: &str, swarm: bool) -> Result<Arc<dyn ContainerRuntime>>;
}
