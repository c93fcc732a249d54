//! Consul cluster bring-up
//!
//! Servers run on dedicated machines: the first node bootstraps and the
//! others join it. Machines of groups with `consul: true` get an agent and
//! a registrator once they are created.

use super::machines::{self, MachineRole};
use crate::container::{RestartPolicy, RunConfig, RuntimeConnector};
use crate::discovery::CONSUL_HTTP_PORT;
use crate::error::{ArmadaError, Result};
use crate::machine::MachineProvisioner;
use crate::topology::{ClusterTopology, PortBinding};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Docker socket as the registrator sees it
const DOCKER_SOCKET_BIND: &str = "/var/run/docker.sock:/tmp/docker.sock";

/// Every port a consul server or agent publishes
pub fn port_bindings() -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = [8300, 8301, 8302, 8400, CONSUL_HTTP_PORT, 53]
        .into_iter()
        .map(|port| PortBinding::fixed("tcp", port))
        .collect();
    bindings.extend([8301, 8302, 53].into_iter().map(|port| PortBinding::fixed("udp", port)));
    bindings
}

fn server_config(topology: &ClusterTopology, name: String, node: &str, cmd: Vec<String>) -> RunConfig {
    RunConfig {
        image: topology.consul_cluster.server.image.clone(),
        hostname: Some(name.clone()),
        name,
        port_bindings: port_bindings(),
        env: vec![format!("constraint:node=={}", node)],
        cmd,
        restart_policy: Some(RestartPolicy::always()),
        ..Default::default()
    }
}

/// The server every other server joins
pub fn bootstrap_config(topology: &ClusterTopology, node: &str, ip: &str) -> RunConfig {
    let domain = topology.consul_cluster.server.domain.as_str();
    let cmd = ["-server", "-bootstrap", "-domain", domain, "-advertise", ip]
        .iter()
        .map(|s| s.to_string())
        .collect();
    server_config(topology, format!("{}-boot", node), node, cmd)
}

/// A server joining the bootstrap server at `bootstrap_ip`
pub fn join_config(topology: &ClusterTopology, node: &str, ip: &str, bootstrap_ip: &str) -> RunConfig {
    let domain = topology.consul_cluster.server.domain.as_str();
    let cmd = ["-server", "-advertise", ip, "-join", bootstrap_ip, "-domain", domain]
        .iter()
        .map(|s| s.to_string())
        .collect();
    server_config(topology, format!("{}-join", node), node, cmd)
}

pub fn agent_config(topology: &ClusterTopology, node: &str, ip: &str, server_ip: &str) -> RunConfig {
    let name = format!("{}-consul-agent", node);
    RunConfig {
        image: topology.consul_cluster.agent.image.clone(),
        hostname: Some(name.clone()),
        name,
        port_bindings: port_bindings(),
        env: vec!["SERVICE_NAME=consul-agent".to_string()],
        cmd: vec!["-advertise".to_string(), ip.to_string(), "-join".to_string(), server_ip.to_string()],
        ..Default::default()
    }
}

pub fn registrator_config(topology: &ClusterTopology, node: &str, ip: &str) -> RunConfig {
    RunConfig {
        name: format!("{}-consul-registrator", node),
        image: topology.consul_cluster.registrator.image.clone(),
        binds: vec![DOCKER_SOCKET_BIND.to_string()],
        cmd: vec![
            "-ip".to_string(),
            ip.to_string(),
            format!("consul://{}:{}", ip, CONSUL_HTTP_PORT),
        ],
        ..Default::default()
    }
}

/// Replace every server node name in `discovery` by its address, longest
/// names first so `consul-1` does not clobber `consul-10`
pub fn substitute_nodes(discovery: &str, nodes: &[String], ips: &[String]) -> String {
    let mut pairs: Vec<(&String, &String)> = nodes.iter().zip(ips.iter()).collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    pairs
        .into_iter()
        .fold(discovery.to_string(), |acc, (node, ip)| acc.replace(node.as_str(), ip))
}

/// Make sure the consul servers run and record their addresses.
///
/// Does nothing when the addresses are given. Otherwise existing server
/// machines are started, or all of them are created and the server
/// containers run on them. The addresses are stored on the topology and
/// substituted into the swarm discovery URL.
pub async fn bootstrap(
    topology: &mut ClusterTopology,
    provisioner: &Arc<dyn MachineProvisioner>,
    connector: &Arc<dyn RuntimeConnector>,
) -> Result<()> {
    let server = topology.consul_cluster.server.clone();
    if !server.ips.is_empty() {
        tracing::info!("Consul servers {:?} are managed elsewhere", server.ips);
        return Ok(());
    }
    if server.nodes.is_empty() {
        tracing::debug!("No consul server declared");
        return Ok(());
    }

    let existing: Vec<_> = provisioner
        .list()
        .await?
        .into_iter()
        .filter(|m| server.nodes.contains(&m.name))
        .collect();

    let mut ips = Vec::with_capacity(server.nodes.len());
    if !existing.is_empty() {
        if existing.len() != server.nodes.len() {
            return Err(ArmadaError::InvalidConfig(format!(
                "{} consul servers declared but {} found",
                server.nodes.len(),
                existing.len()
            )));
        }

        let stopped: Vec<String> = existing
            .iter()
            .filter(|m| !m.is_running())
            .map(|m| m.name.clone())
            .collect();
        if !stopped.is_empty() {
            tracing::info!("Starting stopped consul servers {:?}", stopped);
            if let Some(e) = provisioner.start(&stopped).await.error {
                return Err(e);
            }
        }
        for node in &server.nodes {
            ips.push(provisioner.ip(node).await?);
        }
    } else {
        create_servers(topology, provisioner, &server.nodes).await?;
        for node in &server.nodes {
            ips.push(provisioner.ip(node).await?);
        }
        run_servers(topology, connector, &server.nodes, &ips).await?;
    }

    topology.discovery = substitute_nodes(&topology.discovery, &server.nodes, &ips);
    topology.consul_cluster.server.ips = ips;
    tracing::info!(
        "Consul servers ready at {:?}, discovery {}",
        topology.consul_cluster.server.ips,
        topology.discovery
    );
    Ok(())
}

async fn create_servers(
    topology: &ClusterTopology,
    provisioner: &Arc<dyn MachineProvisioner>,
    nodes: &[String],
) -> Result<()> {
    let group = &topology.consul_cluster.server.machine;
    let spec = topology
        .machine_group(group)
        .ok_or_else(|| ArmadaError::GroupNotFound(group.clone()))?;
    if nodes.len() > spec.min_num {
        return Err(ArmadaError::InvalidConfig(format!(
            "{} consul server nodes declared but group '{}' has min_num {}",
            nodes.len(),
            group,
            spec.min_num
        )));
    }

    let (global, create) = machines::create_options(topology, spec, MachineRole::ConsulServer)?;
    tracing::info!("Creating consul servers {:?}", nodes);

    let mut set = JoinSet::new();
    for node in nodes.iter().cloned() {
        let provisioner = provisioner.clone();
        let global = global.clone();
        let create = create.clone();
        set.spawn(async move {
            let result = provisioner.create(&node, &global, &create).await;
            (node, result)
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((node, Ok(()))) => tracing::info!("Consul server {} created", node),
            Ok((node, Err(e))) => {
                tracing::error!("Creating consul server {} failed: {}", node, e);
                errors.push(e);
            }
            Err(e) => errors.push(ArmadaError::Machine(e.to_string())),
        }
    }
    ArmadaError::collect("create consul servers", errors)
}

async fn run_servers(
    topology: &ClusterTopology,
    connector: &Arc<dyn RuntimeConnector>,
    nodes: &[String],
    ips: &[String],
) -> Result<()> {
    let (Some(boot_node), Some(boot_ip)) = (nodes.first(), ips.first()) else {
        return Ok(());
    };

    let runtime = connector.connect(boot_node, false).await?;
    let id = runtime.run(&bootstrap_config(topology, boot_node, boot_ip)).await?;
    tracing::info!("Bootstrap consul server running on {} ({}) as {}", boot_node, boot_ip, id);

    let mut set = JoinSet::new();
    for (node, ip) in nodes.iter().zip(ips.iter()).skip(1) {
        let config = join_config(topology, node, ip, boot_ip);
        let connector = connector.clone();
        let node = node.clone();
        set.spawn(async move {
            let result = async {
                let runtime = connector.connect(&node, false).await?;
                runtime.run(&config).await
            }
            .await;
            (node, result)
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((node, Ok(id))) => tracing::info!("Consul server on {} joined as {}", node, id),
            Ok((node, Err(e))) => {
                tracing::error!("Consul server on {} failed to join: {}", node, e);
                errors.push(e);
            }
            Err(e) => errors.push(ArmadaError::Container(e.to_string())),
        }
    }
    ArmadaError::collect("join consul servers", errors)
}

/// Run the consul agent and registrator on a new machine
pub async fn start_agent(
    topology: &ClusterTopology,
    provisioner: &dyn MachineProvisioner,
    connector: &dyn RuntimeConnector,
    node: &str,
) -> Result<()> {
    let server_ip = topology.consul_cluster.server.ips.first().ok_or_else(|| {
        ArmadaError::InvalidConfig(format!("No consul server for the agent on {} to join", node))
    })?;
    let ip = provisioner.ip(node).await?;
    let runtime = connector.connect(node, false).await?;

    let id = runtime.run(&agent_config(topology, node, &ip, server_ip)).await?;
    tracing::info!("Consul agent running on {} as {}", node, id);
    let id = runtime.run(&registrator_config(topology, node, &ip)).await?;
    tracing::info!("Consul registrator running on {} as {}", node, id);
    Ok(())
}
