//! Cluster topology types

use super::port::PortBinding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key naming the driver of a service discover description
pub const SD_DRIVER_KEY: &str = "driver";

/// Key naming the container group a service discover description tracks
pub const SD_CONTAINER_KEY: &str = "container";

/// Declared cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTopology {
    /// Cluster manager, such as `swarm`
    #[serde(alias = "clusterby")]
    pub cluster_by: String,
    /// Name of the master machine
    pub master: String,
    /// Machine group the master is created from
    #[serde(alias = "mastergroup")]
    pub master_group: String,
    /// Swarm discovery URL; consul node names are replaced by their IPs
    pub discovery: String,
    /// Machine side of the cluster
    pub machine: MachineCluster,
    /// Container side of the cluster
    pub container: ContainerCluster,
    /// Discovery backends by name
    #[serde(alias = "servicediscover")]
    pub service_discover: HashMap<String, ServiceDiscoverDescription>,
    /// Consul servers, agents and registrators
    #[serde(alias = "consulcluster")]
    pub consul_cluster: ConsulDescription,
}

/// Machine groups and the cloud drivers that create them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineCluster {
    /// Operating system image
    pub os: String,
    /// Cloud drivers by name
    pub cloud: HashMap<String, CloudDriver>,
    /// Machine groups
    pub topology: Vec<MachineGroupSpec>,
}

/// Options passed to `docker-machine` for one cloud driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudDriver {
    /// Space separated `create` options
    pub options: String,
    /// Space separated global options
    #[serde(alias = "globaloptions")]
    pub global_options: String,
    /// Used when a machine group names no cloud
    pub default: bool,
}

impl CloudDriver {
    /// Split the `create` options
    pub fn create_options(&self) -> Vec<String> {
        self.options.split_whitespace().map(str::to_string).collect()
    }

    /// Split the global options
    pub fn global_options(&self) -> Vec<String> {
        self.global_options.split_whitespace().map(str::to_string).collect()
    }
}

/// Disk declared for a machine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    #[serde(rename = "type")]
    pub kind: String,
    pub capacity: String,
}

/// One machine group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineGroupSpec {
    /// Group name
    pub group: String,
    /// Machines that must be running
    #[serde(alias = "minnum")]
    pub min_num: usize,
    /// Machines allowed to run
    #[serde(alias = "maxnum")]
    pub max_num: usize,
    /// Cloud driver, the default driver when empty
    pub cloud: String,
    /// Command run over ssh on every new machine
    pub init: String,
    pub region: String,
    /// Run a consul agent and registrator on every new machine
    pub consul: bool,
    /// Extra `create` options for this group
    #[serde(alias = "driveropts")]
    pub driver_opts: Vec<String>,
    pub cpu: u32,
    pub memory: String,
    pub disk: Disk,
}

/// Container groups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerCluster {
    pub topology: Vec<ContainerGroupSpec>,
}

/// One container group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerGroupSpec {
    /// Group name, `{port}` is replaced by the host port
    pub group: String,
    /// Containers that should be running
    pub num: usize,
    pub image: String,
    /// Service URL, `{tag}.{name}`; `{port}` is replaced by the host port
    pub url: String,
    /// Port binding string
    pub port: String,
    /// Parsed form of `port`, filled in at load time
    #[serde(skip)]
    pub port_binding: Option<PortBinding>,
    /// Groups deployed before this one
    pub deps: Vec<String>,
    /// Discovery backend the group registers with
    #[serde(alias = "servicediscover")]
    pub service_discover: String,
    /// Restart running containers even when their image is current
    pub restart: bool,
    /// Machine group the containers are placed on
    pub machine: String,
    /// Bind mounts
    #[serde(alias = "volums")]
    pub volumes: Vec<String>,
    /// Extra `KEY=value` environment
    pub env: Vec<String>,
}

impl ContainerGroupSpec {
    /// Container port of the binding, if parsed
    pub fn container_port(&self) -> Option<u16> {
        self.port_binding.as_ref().map(|pb| pb.container_port)
    }

    /// Whether the group registers with a discovery backend
    pub fn registers_service(&self) -> bool {
        !self.service_discover.is_empty()
    }
}

/// A discovery backend: `driver`, `container` and driver specific keys
pub type ServiceDiscoverDescription = HashMap<String, String>;

/// Consul servers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulServer {
    pub image: String,
    pub domain: String,
    /// Machines hosting a consul server, the first one bootstraps
    pub nodes: Vec<String>,
    /// Server addresses; when given the servers are not managed here
    pub ips: Vec<String>,
    /// Machine group the server nodes are created from
    pub machine: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulAgent {
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulRegistrator {
    pub image: String,
}

/// Consul cluster declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulDescription {
    pub server: ConsulServer,
    pub agent: ConsulAgent,
    pub registrator: ConsulRegistrator,
}

impl ClusterTopology {
    /// Look up a machine group
    pub fn machine_group(&self, group: &str) -> Option<&MachineGroupSpec> {
        self.machine.topology.iter().find(|m| m.group == group)
    }

    /// Look up a container group
    pub fn container_group(&self, group: &str) -> Option<&ContainerGroupSpec> {
        self.container.topology.iter().find(|c| c.group == group)
    }

    /// The cloud driver marked as default, if any
    pub fn default_driver(&self) -> Option<(&str, &CloudDriver)> {
        let mut drivers: Vec<_> = self.machine.cloud.iter().filter(|(_, d)| d.default).collect();
        drivers.sort_by(|a, b| a.0.cmp(b.0));
        drivers.first().map(|(name, driver)| (name.as_str(), *driver))
    }

    /// Cloud driver for a machine group, falling back to the default
    pub fn driver_for(&self, spec: &MachineGroupSpec) -> Option<(&str, &CloudDriver)> {
        if spec.cloud.is_empty() {
            return self.default_driver();
        }
        self.machine
            .cloud
            .get_key_value(&spec.cloud)
            .map(|(name, driver)| (name.as_str(), driver))
    }

    /// Container group a discovery backend tracks
    pub fn discovery_target(&self, backend: &str) -> Option<&str> {
        self.service_discover
            .get(backend)
            .and_then(|d| d.get(SD_CONTAINER_KEY))
            .map(String::as_str)
    }
}
