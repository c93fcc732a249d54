//! Service registration around container start and stop

use crate::container::ContainerInfo;
use crate::discovery::{DriverContext, DriverRegistry, ServiceRegisterDriver};
use crate::error::{ArmadaError, Result};
use crate::topology::{ClusterTopology, ContainerGroupSpec};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

/// The drivers of one deploy, by backend name
#[derive(Clone, Default)]
pub struct ServiceCoordinator {
    drivers: HashMap<String, Arc<dyn ServiceRegisterDriver>>,
}

impl ServiceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a driver for every declared backend
    pub fn build(topology: &ClusterTopology, registry: &DriverRegistry, client: &Client) -> Result<Self> {
        let mut coordinator = Self::new();
        for (backend, description) in &topology.service_discover {
            let ctx = DriverContext {
                description: description.clone(),
                consul_ips: topology.consul_cluster.server.ips.clone(),
                client: client.clone(),
            };
            let driver = registry.build(&ctx)?;
            tracing::info!("Service discover '{}' uses driver {}", backend, driver.name());
            coordinator.drivers.insert(backend.clone(), driver);
        }
        Ok(coordinator)
    }

    /// Use `driver` for `backend`
    pub fn insert(&mut self, backend: &str, driver: Arc<dyn ServiceRegisterDriver>) {
        self.drivers.insert(backend.to_string(), driver);
    }

    fn driver(&self, backend: &str) -> Result<&Arc<dyn ServiceRegisterDriver>> {
        self.drivers.get(backend).ok_or_else(|| {
            ArmadaError::Discovery(format!("No service register driver available for '{}'", backend))
        })
    }

    /// Register the endpoint a container publishes for its group's port
    pub async fn register(&self, container: &ContainerInfo, spec: &ContainerGroupSpec) -> Result<()> {
        if !spec.registers_service() {
            tracing::debug!("Group {} has no service discover, {} not registered", spec.group, container.name);
            return Ok(());
        }

        let port = spec.container_port().ok_or_else(|| {
            ArmadaError::InvalidConfig(format!(
                "Group '{}' registers with '{}' but binds no port",
                spec.group, spec.service_discover
            ))
        })?;
        let published = container.port_for(port).ok_or_else(|| {
            ArmadaError::Discovery(format!(
                "Container {} does not publish port {} of group {}",
                container.name, port, spec.group
            ))
        })?;

        self.driver(&spec.service_discover)?
            .register(&published.ip, published.public_port)
            .await?;
        tracing::info!(
            "Registered {} as {}:{} with {}",
            container.name,
            published.ip,
            published.public_port,
            spec.service_discover
        );
        Ok(())
    }

    /// Remove `host:port` from the group's backend
    pub async fn unregister(&self, host: &str, port: u16, spec: &ContainerGroupSpec) -> Result<()> {
        if !spec.registers_service() {
            return Ok(());
        }
        tracing::info!("Unregistering {}:{} from {}", host, port, spec.service_discover);
        self.driver(&spec.service_discover)?.unregister(host, port).await
    }

    /// Unregister a container before it stops; a container without the
    /// group's published port has nothing registered
    pub async fn unregister_container(&self, container: &ContainerInfo, spec: &ContainerGroupSpec) -> Result<()> {
        let published = spec
            .container_port()
            .and_then(|port| container.port_for(port))
            .or_else(|| container.ports.first());
        match published {
            Some(p) => self.unregister(&p.ip, p.public_port, spec).await,
            None => {
                tracing::debug!("Container {} publishes no port, nothing to unregister", container.name);
                Ok(())
            }
        }
    }

    /// Hand every backend the full address list of its target group.
    ///
    /// Best effort: a failing backend is logged and the others still resync.
    pub async fn resync(&self, topology: &ClusterTopology, containers: &[ContainerInfo]) {
        let mut backends: Vec<&String> = self.drivers.keys().collect();
        backends.sort();

        for backend in backends {
            let Some(target) = topology.discovery_target(backend) else {
                continue;
            };
            let Some(port) = topology.container_group(target).and_then(|s| s.container_port()) else {
                tracing::debug!("Group {} binds no port, skipping resync of {}", target, backend);
                continue;
            };

            let urls = endpoints(containers, target, port);
            if urls.is_empty() {
                tracing::info!("No running container of {} for service discover {}", target, backend);
                continue;
            }

            tracing::info!("Resyncing {} with {:?}", backend, urls);
            if let Some(driver) = self.drivers.get(backend.as_str()) {
                if let Err(e) = driver.registry(urls).await {
                    tracing::warn!("Resync of {} failed: {}", backend, e);
                }
            }
        }
    }
}

/// `ip:port` of every running container of `group` publishing `port`
pub fn endpoints(containers: &[ContainerInfo], group: &str, port: u16) -> Vec<String> {
    containers
        .iter()
        .filter(|c| c.group().as_deref() == Some(group))
        .filter(|c| {
            if !c.is_up() {
                tracing::debug!("Container {} of {} is not up", c.name, group);
            }
            c.is_up()
        })
        .flat_map(|c| c.ports.iter().filter(|p| p.private_port == port))
        .map(|p| format!("{}:{}", p.ip, p.public_port))
        .collect()
}
