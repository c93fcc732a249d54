//! Cluster context and the overall deploy sequence

use super::inventory::Inventory;
use super::machines;
use super::plan::DeployPlan;
use super::services::ServiceCoordinator;
use super::{consul, DeployOptions};
use crate::container::{ContainerRuntime, FilterChain, ListFilter, RuntimeConnector};
use crate::discovery::{self, DriverRegistry};
use crate::error::Result;
use crate::machine::MachineProvisioner;
use crate::sequence::SequenceRegistry;
use crate::topology::ClusterTopology;
use reqwest::Client;
use std::sync::Arc;

/// State shared by every task of one deploy once the master is reachable
pub(crate) struct Deployment {
    pub(crate) topology: ClusterTopology,
    pub(crate) options: DeployOptions,
    pub(crate) provisioner: Arc<dyn MachineProvisioner>,
    pub(crate) connector: Arc<dyn RuntimeConnector>,
    /// Swarm endpoint on the master
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) services: ServiceCoordinator,
    pub(crate) filters: FilterChain,
    pub(crate) machine_seqs: Arc<SequenceRegistry>,
    pub(crate) container_seqs: Arc<SequenceRegistry>,
    pub(crate) inventory: Arc<Inventory>,
}

impl Deployment {
    /// Replace the machine snapshot
    pub(crate) async fn reload_machines(&self) -> Result<()> {
        let machines = self.provisioner.list().await?;
        self.inventory.replace_machines(machines)
    }

    /// Reseed container sequences from every container, then keep the ones
    /// the filters select
    pub(crate) async fn reload_containers(&self) -> Result<()> {
        let all = self.runtime.list(&ListFilter::all()).await?;
        self.container_seqs.observe_names(all.iter().map(|c| c.name.as_str()))?;

        let selected = if self.filters.is_empty() {
            all
        } else {
            self.filters.apply(all)?
        };
        tracing::info!("Loaded {} containers", selected.len());
        self.inventory.replace_containers(selected)
    }

    /// Resync every backend from the unfiltered container list
    pub(crate) async fn resync(&self) -> Result<()> {
        let all = self.runtime.list(&ListFilter::all()).await?;
        self.services.resync(&self.topology, &all).await;
        Ok(())
    }

    /// Whether the filters leave `group` in scope
    pub(crate) fn in_scope(&self, group: &str) -> bool {
        self.filters.group().map_or(true, |g| g == group)
    }
}

/// Owns a declared cluster and reconciles it against live state
pub struct ClusterContext {
    topology: ClusterTopology,
    options: DeployOptions,
    provisioner: Arc<dyn MachineProvisioner>,
    connector: Arc<dyn RuntimeConnector>,
    drivers: DriverRegistry,
    client: Client,
    machine_seqs: Arc<SequenceRegistry>,
    container_seqs: Arc<SequenceRegistry>,
    inventory: Arc<Inventory>,
}

impl ClusterContext {
    /// Create a context with the built-in discovery drivers
    pub fn new(
        topology: ClusterTopology,
        options: DeployOptions,
        provisioner: Arc<dyn MachineProvisioner>,
        connector: Arc<dyn RuntimeConnector>,
    ) -> Result<Self> {
        Ok(Self {
            topology,
            options,
            provisioner,
            connector,
            drivers: DriverRegistry::with_builtin(),
            client: discovery::http_client()?,
            machine_seqs: Arc::new(SequenceRegistry::new()),
            container_seqs: Arc::new(SequenceRegistry::new()),
            inventory: Arc::new(Inventory::new()),
        })
    }

    /// Replace the discovery driver registry
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Live state as of the last reload
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Order the container groups without touching any collaborator
    pub fn plan(&self) -> Result<DeployPlan> {
        DeployPlan::build(&self.topology)
    }

    /// Bring the cluster to the declared state.
    ///
    /// Configuration errors surface before the first side effect. Any
    /// machine or container failure stops the deploy at the phase it
    /// happened in; completed phases are not rolled back.
    pub async fn deploy(&mut self) -> Result<()> {
        let plan = self.plan()?;
        let filters = FilterChain::from_pairs(self.options.filters.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        filters.check_scaling(self.options.container_scale_in, self.options.container_scale_out)?;

        tracing::info!("Loading the cluster machines");
        self.inventory.replace_machines(self.provisioner.list().await?)?;

        tracing::info!("Starting the consul cluster");
        consul::bootstrap(&mut self.topology, &self.provisioner, &self.connector).await?;

        tracing::info!("Ensuring master {}", self.topology.master);
        machines::ensure_master(&self.topology, self.provisioner.as_ref()).await?;
        self.inventory.replace_machines(self.provisioner.list().await?)?;

        let runtime = self.connector.connect(&self.topology.master, true).await?;
        let services = ServiceCoordinator::build(&self.topology, &self.drivers, &self.client)?;

        // The master seeds its group too, or a second master-group machine
        // would reuse its name
        self.machine_seqs
            .observe_names(self.inventory.machines()?.iter().map(|m| m.name.as_str()))?;

        let deployment = Arc::new(Deployment {
            topology: self.topology.clone(),
            options: self.options.clone(),
            provisioner: self.provisioner.clone(),
            connector: self.connector.clone(),
            runtime,
            services,
            filters,
            machine_seqs: self.machine_seqs.clone(),
            container_seqs: self.container_seqs.clone(),
            inventory: self.inventory.clone(),
        });

        tracing::info!("Loading containers");
        deployment.reload_containers().await?;

        tracing::info!("Ensuring machine capacity");
        deployment.scale_machines_out().await?;
        deployment.scale_machines_in().await?;
        deployment.reload_machines().await?;

        for (idx, level) in plan.discovery_levels.iter().enumerate() {
            tracing::info!("Deploying discovery level {}: {:?}", idx + 1, level);
            deployment.deploy_level(level).await?;
            deployment.reload_containers().await?;
        }

        deployment.resync().await?;

        for (idx, level) in plan.business_levels.iter().enumerate() {
            tracing::info!("Deploying business level {}: {:?}", idx + 1, level);
            deployment.deploy_level(level).await?;
            deployment.reload_containers().await?;
            deployment.resync().await?;
        }

        deployment.reload_containers().await?;
        tracing::info!("Deploy complete");
        Ok(())
    }
}
