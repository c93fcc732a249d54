//! Container group deployment
//!
//! A group is deployed in four phases: rolling update of the running
//! containers, scale-out, scale-in, then removal of stopped containers.
//! The rolling update works on the filtered snapshot loaded before the
//! level; the later phases list the group afresh.

use super::context::Deployment;
use crate::container::{ContainerInfo, ListFilter, RunConfig};
use crate::discovery::CONSUL_HTTP_PORT;
use crate::error::{ArmadaError, Result};
use crate::topology::{ClusterTopology, ContainerGroupSpec};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run configuration of a new container of `spec` named `name`
pub fn build_run_config(topology: &ClusterTopology, spec: &ContainerGroupSpec, name: String) -> RunConfig {
    let consul_ips = &topology.consul_cluster.server.ips;

    let mut env = vec!["constraint:role==slave".to_string()];
    if !spec.machine.is_empty() {
        env.push(format!("constraint:group=={}", spec.machine));
    }
    env.extend(spec.env.iter().cloned());
    if let Some(ip) = consul_ips.first() {
        env.push(format!("CONSUL_URL={}:{}", ip, CONSUL_HTTP_PORT));
    }
    if !spec.url.is_empty() {
        match spec.url.split_once('.') {
            Some((tags, service)) if !tags.is_empty() => {
                env.push(format!("SERVICE_TAGS={}", tags));
                env.push(format!("SERVICE_NAME={}", service));
            }
            _ => env.push(format!("SERVICE_NAME={}", spec.url)),
        }
    }

    RunConfig {
        name,
        image: spec.image.clone(),
        port_bindings: spec.port_binding.iter().cloned().collect(),
        env,
        dns: consul_ips.clone(),
        binds: spec.volumes.clone(),
        ..Default::default()
    }
}

/// Running containers to stop so that `keep` remain, oldest first
pub fn surplus_containers(running: &[ContainerInfo], keep: usize) -> Vec<ContainerInfo> {
    let mut candidates: Vec<&ContainerInfo> = running.iter().collect();
    candidates.sort_by_key(|c| (c.created, c.resource_name().map(|n| n.seq).unwrap_or(u64::MAX)));
    let surplus = running.len().saturating_sub(keep);
    candidates.into_iter().take(surplus).cloned().collect()
}

impl Deployment {
    /// Deploy every in-scope group of a level concurrently
    pub(crate) async fn deploy_level(self: &Arc<Self>, groups: &[String]) -> Result<()> {
        let mut set = JoinSet::new();
        for group in groups {
            if !self.in_scope(group) {
                tracing::debug!("Group {} is filtered out", group);
                continue;
            }
            let spec = self
                .topology
                .container_group(group)
                .cloned()
                .ok_or_else(|| ArmadaError::GroupNotFound(group.clone()))?;
            let deployment = self.clone();
            set.spawn(async move {
                let result = deployment.deploy_group(&spec).await;
                (spec.group, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((group, Ok(()))) => tracing::info!("Group {} deployed", group),
                Ok((group, Err(e))) => {
                    tracing::error!("Deploying group {} failed: {}", group, e);
                    errors.push(e);
                }
                Err(e) => errors.push(ArmadaError::Container(e.to_string())),
            }
        }
        ArmadaError::collect("deploy level", errors)
    }

    pub(crate) async fn deploy_group(self: &Arc<Self>, spec: &ContainerGroupSpec) -> Result<()> {
        tracing::info!("Deploying group {} with image {}", spec.group, spec.image);
        self.rolling_update(spec).await?;
        self.scale_out(spec).await?;
        self.scale_in(spec).await?;
        self.remove_stopped(spec).await
    }

    /// Every container of the group as the runtime reports it now
    async fn group_containers(&self, group: &str) -> Result<Vec<ContainerInfo>> {
        self.runtime.list(&ListFilter::group(group)).await
    }

    /// Cycle running containers on a stale image, or all of them when the
    /// group restarts unconditionally, a bounded number at a time
    async fn rolling_update(self: &Arc<Self>, spec: &ContainerGroupSpec) -> Result<()> {
        let running: Vec<ContainerInfo> = self
            .inventory
            .containers_in_group(&spec.group)?
            .into_iter()
            .filter(|c| c.is_up())
            .collect();
        if running.is_empty() {
            tracing::debug!("No running container in group {}", spec.group);
            return Ok(());
        }

        let targets: Vec<ContainerInfo> = running
            .iter()
            .filter(|c| spec.restart || c.image != spec.image)
            .cloned()
            .collect();
        if targets.is_empty() {
            tracing::debug!("Group {} is current", spec.group);
            return Ok(());
        }

        let limit = self.options.rolling_limit(running.len());
        tracing::info!(
            "Rolling {} of {} containers in group {}, {} at a time",
            targets.len(),
            running.len(),
            spec.group,
            limit
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set = JoinSet::new();
        for container in targets {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ArmadaError::Lock(e.to_string()))?;
            let deployment = self.clone();
            let spec = spec.clone();
            set.spawn(async move {
                let result = deployment.cycle_container(&container, &spec).await;
                drop(permit);
                (container.name, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::debug!("Container {} cycled", name),
                Ok((name, Err(e))) => {
                    tracing::error!("Cycling container {} failed: {}", name, e);
                    errors.push(e);
                }
                Err(e) => errors.push(ArmadaError::Container(e.to_string())),
            }
        }
        ArmadaError::collect("rolling update", errors)
    }

    /// Stop one container, then restart it when its image is current or
    /// replace it with a new container
    async fn cycle_container(&self, container: &ContainerInfo, spec: &ContainerGroupSpec) -> Result<()> {
        self.stop_container(container, Some(spec)).await?;

        if container.image == spec.image {
            match self.restart_container(container, spec).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(
                    "Restarting {} failed, running a new container instead: {}",
                    container.name,
                    e
                ),
            }
        }
        self.run_container(spec).await.map(|_| ())
    }

    async fn scale_out(self: &Arc<Self>, spec: &ContainerGroupSpec) -> Result<()> {
        if !self.options.container_scale_out {
            tracing::debug!("Container scale-out disabled for group {}", spec.group);
            return Ok(());
        }

        let running = self
            .group_containers(&spec.group)
            .await?
            .iter()
            .filter(|c| c.is_up())
            .count();
        if running >= spec.num {
            tracing::debug!("Group {} has {} running, {} wanted", spec.group, running, spec.num);
            return Ok(());
        }

        let missing = spec.num - running;
        tracing::info!("Running {} new containers in group {}", missing, spec.group);
        let mut set = JoinSet::new();
        for _ in 0..missing {
            let deployment = self.clone();
            let spec = spec.clone();
            set.spawn(async move { deployment.run_container(&spec).await });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(info)) => tracing::debug!("Container {} running", info.name),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(ArmadaError::Container(e.to_string())),
            }
        }
        ArmadaError::collect("container scale out", errors)
    }

    async fn scale_in(self: &Arc<Self>, spec: &ContainerGroupSpec) -> Result<()> {
        if !self.options.container_scale_in {
            tracing::debug!("Container scale-in disabled for group {}", spec.group);
            return Ok(());
        }

        let running: Vec<ContainerInfo> = self
            .group_containers(&spec.group)
            .await?
            .into_iter()
            .filter(|c| c.is_up())
            .collect();
        if running.len() <= spec.num {
            return Ok(());
        }

        let victims = surplus_containers(&running, spec.num);
        tracing::info!(
            "Stopping {} containers of group {}: {:?}",
            victims.len(),
            spec.group,
            victims.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );

        let mut set = JoinSet::new();
        for container in victims {
            let deployment = self.clone();
            let spec = spec.clone();
            set.spawn(async move { deployment.stop_container(&container, Some(&spec)).await });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(ArmadaError::Container(e.to_string())),
            }
        }
        ArmadaError::collect("container scale in", errors)
    }

    /// Remove the group's stopped containers; failures are only logged
    async fn remove_stopped(&self, spec: &ContainerGroupSpec) -> Result<()> {
        if !self.options.remove_stopped {
            tracing::debug!("Keeping stopped containers of group {}", spec.group);
            return Ok(());
        }

        let stopped: Vec<ContainerInfo> = self
            .group_containers(&spec.group)
            .await?
            .into_iter()
            .filter(|c| !c.is_up())
            .collect();
        for container in stopped {
            match self.runtime.remove(&container.id).await {
                Ok(()) => tracing::info!("Removed stopped container {}", container.name),
                Err(e) => tracing::warn!("Removing container {} failed: {}", container.name, e),
            }
        }
        Ok(())
    }

    /// Run a new container of the group and register it
    pub(crate) async fn run_container(&self, spec: &ContainerGroupSpec) -> Result<ContainerInfo> {
        let name = self.container_seqs.next_name(&spec.group)?;
        tracing::info!("Running container {} from {}", name, spec.image);
        let config = build_run_config(&self.topology, spec, name);

        let id = self.runtime.run(&config).await?;
        let info = self.runtime.get(&id).await?;
        self.services.register(&info, spec).await?;
        Ok(info)
    }

    /// Unregister a container, when its group is known, then stop it
    pub(crate) async fn stop_container(&self, container: &ContainerInfo, spec: Option<&ContainerGroupSpec>) -> Result<()> {
        if let Some(spec) = spec {
            self.services.unregister_container(container, spec).await?;
        }
        self.runtime.stop(&container.id).await?;
        tracing::info!("Container {} stopped", container.name);
        Ok(())
    }

    async fn restart_container(&self, container: &ContainerInfo, spec: &ContainerGroupSpec) -> Result<()> {
        self.runtime.restart(&container.id).await?;
        let info = self.runtime.get(&container.id).await?;
        self.services.register(&info, spec).await?;
        tracing::info!("Container {} restarted", container.name);
        Ok(())
    }
}
