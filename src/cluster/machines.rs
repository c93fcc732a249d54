//! Machine capacity
//!
//! Every machine group is kept between its `min_num` running machines and
//! its `max_num` machines in total. Scale-out starts stopped machines before
//! creating new ones; scale-in destroys stopped machines first, then the
//! running machines with the lowest sequence, never the master.

use super::consul;
use super::context::Deployment;
use crate::container::ListFilter;
use crate::error::{ArmadaError, Result};
use crate::machine::{MachineInfo, MachineProvisioner};
use crate::naming::ResourceName;
use crate::topology::{ClusterTopology, MachineGroupSpec};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Cluster manager the machines are created for
pub const CLUSTER_BY_SWARM: &str = "swarm";

/// What a new machine is created as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineRole {
    /// The swarm master
    Master,
    /// A swarm node that runs containers
    Slave,
    /// A consul server node, outside the swarm
    ConsulServer,
}

/// Global and `create` options for a new machine of `spec`
pub fn create_options(
    topology: &ClusterTopology,
    spec: &MachineGroupSpec,
    role: MachineRole,
) -> Result<(Vec<String>, Vec<String>)> {
    if !topology.cluster_by.is_empty() && topology.cluster_by != CLUSTER_BY_SWARM {
        return Err(ArmadaError::InvalidConfig(format!(
            "Cluster manager '{}' is not supported",
            topology.cluster_by
        )));
    }

    let (driver_name, driver) = topology.driver_for(spec).ok_or_else(|| {
        ArmadaError::InvalidConfig(format!("No cloud driver for machine group '{}'", spec.group))
    })?;

    let mut create = vec!["-d".to_string(), driver_name.to_string()];
    if role != MachineRole::ConsulServer {
        create.push("--swarm".to_string());
        if role == MachineRole::Master {
            create.push("--swarm-master".to_string());
        }
        create.push("--swarm-discovery".to_string());
        create.push(topology.discovery.clone());
    }

    let labels = match role {
        MachineRole::Master => vec!["role=master".to_string(), format!("group={}", spec.group)],
        MachineRole::Slave => vec!["role=slave".to_string(), format!("group={}", spec.group)],
        MachineRole::ConsulServer => vec!["role=consulserver".to_string(), "group=consulcluster".to_string()],
    };
    for label in labels {
        create.push("--engine-label".to_string());
        create.push(label);
    }

    create.extend(driver.create_options());
    create.extend(spec.driver_opts.iter().cloned());
    Ok((driver.global_options(), create))
}

/// Group the master is created from
pub fn master_group(topology: &ClusterTopology) -> String {
    if !topology.master_group.is_empty() {
        return topology.master_group.clone();
    }
    ResourceName::parse(&topology.master)
        .map(|n| n.group)
        .unwrap_or_else(|| topology.master.clone())
}

/// Create the master if it is missing, start it if it is stopped
pub async fn ensure_master(topology: &ClusterTopology, provisioner: &dyn MachineProvisioner) -> Result<()> {
    if topology.master.is_empty() {
        return Err(ArmadaError::InvalidConfig("No master machine declared".to_string()));
    }

    let master = provisioner
        .list()
        .await?
        .into_iter()
        .find(|m| m.name == topology.master);

    match master {
        None => {
            let group = master_group(topology);
            let spec = topology
                .machine_group(&group)
                .ok_or_else(|| ArmadaError::GroupNotFound(group.clone()))?;
            tracing::info!("Master {} does not exist, creating it from group {}", topology.master, group);
            let (global, create) = create_options(topology, spec, MachineRole::Master)?;
            provisioner.create(&topology.master, &global, &create).await?;
        }
        Some(m) if !m.is_running() => {
            tracing::info!("Master {} is {}, starting it", m.name, m.state);
            let outcome = provisioner.start(&[m.name.clone()]).await;
            if outcome.succeeded.is_empty() {
                return Err(outcome
                    .error
                    .unwrap_or_else(|| ArmadaError::Machine(format!("Master {} did not start", m.name))));
            }
        }
        Some(_) => tracing::debug!("Master {} is running", topology.master),
    }
    Ok(())
}

/// Machines to destroy so that at most `max` remain, master excluded.
///
/// Stopped machines go first, then running ones by ascending sequence.
pub fn surplus_machines(machines: &[MachineInfo], max: usize) -> Vec<MachineInfo> {
    let surplus = machines.len().saturating_sub(max);
    let mut candidates: Vec<&MachineInfo> = machines.iter().filter(|m| !m.is_master()).collect();
    candidates.sort_by_key(|m| {
        (
            m.is_running(),
            m.resource_name().map(|n| n.seq).unwrap_or(u64::MAX),
            m.name.clone(),
        )
    });
    candidates.into_iter().take(surplus).cloned().collect()
}

impl Deployment {
    /// Bring every machine group up to its minimum, groups in parallel
    pub(crate) async fn scale_machines_out(self: &Arc<Self>) -> Result<()> {
        if !self.options.machine_scale_out {
            tracing::info!("Machine scale-out disabled");
            return Ok(());
        }

        let mut set = JoinSet::new();
        for spec in self.topology.machine.topology.iter().cloned() {
            let deployment = self.clone();
            set.spawn(async move {
                let group = spec.group.clone();
                (group, deployment.scale_group_out(&spec).await)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((group, Ok(()))) => tracing::info!("Machine group {} scaled out", group),
                Ok((group, Err(e))) if e.is_shortfall() && self.options.allow_degraded => {
                    tracing::warn!("Continuing with degraded machine group {}: {}", group, e);
                }
                Ok((group, Err(e))) => {
                    tracing::error!("Scaling out machine group {} failed: {}", group, e);
                    errors.push(e);
                }
                Err(e) => errors.push(ArmadaError::Machine(e.to_string())),
            }
        }
        ArmadaError::collect("machine scale out", errors)
    }

    async fn scale_group_out(self: &Arc<Self>, spec: &MachineGroupSpec) -> Result<()> {
        let machines: Vec<MachineInfo> = self
            .provisioner
            .list()
            .await?
            .into_iter()
            .filter(|m| m.in_group(&spec.group))
            .collect();
        let mut running = machines.iter().filter(|m| m.is_running()).count();
        if running >= spec.min_num {
            tracing::debug!("Machine group {} has {} running, {} required", spec.group, running, spec.min_num);
            return Ok(());
        }

        let mut stopped: Vec<&MachineInfo> = machines.iter().filter(|m| !m.is_running()).collect();
        stopped.sort_by_key(|m| m.resource_name().map(|n| n.seq).unwrap_or(u64::MAX));
        let to_start: Vec<String> = stopped
            .into_iter()
            .take(spec.min_num - running)
            .map(|m| m.name.clone())
            .collect();

        if !to_start.is_empty() {
            tracing::info!("Starting stopped machines of {}: {:?}", spec.group, to_start);
            let outcome = self.provisioner.start(&to_start).await;
            running += outcome.succeeded.len();
            if let Some(e) = outcome.error {
                tracing::warn!("Some machines of {} did not start: {}", spec.group, e);
            }
        }

        if running < spec.min_num {
            let created = self.create_machines(spec, spec.min_num - running).await;
            running += created.len();
        }

        if running < spec.min_num {
            return Err(ArmadaError::CapacityShortfall {
                group: spec.group.clone(),
                running,
                required: spec.min_num,
            });
        }
        tracing::info!("Machine group {} has {} running", spec.group, running);
        Ok(())
    }

    /// Create and initialise `count` machines in parallel; returns the ones
    /// that came up
    async fn create_machines(self: &Arc<Self>, spec: &MachineGroupSpec, count: usize) -> Vec<String> {
        tracing::info!("Creating {} machines of group {}", count, spec.group);
        let (global, create) = match create_options(&self.topology, spec, MachineRole::Slave) {
            Ok(options) => options,
            Err(e) => {
                tracing::error!("Cannot create machines of {}: {}", spec.group, e);
                return Vec::new();
            }
        };

        let mut set = JoinSet::new();
        for _ in 0..count {
            let deployment = self.clone();
            let spec = spec.clone();
            let global = global.clone();
            let create = create.clone();
            set.spawn(async move {
                let name = deployment.machine_seqs.next_name(&spec.group)?;
                deployment.provisioner.create(&name, &global, &create).await?;
                tracing::info!("Machine {} created, initialising", name);
                deployment.init_machine(&name, &spec).await?;
                Ok::<_, ArmadaError>(name)
            });
        }

        let mut created = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(name)) => created.push(name),
                Ok(Err(e)) => tracing::warn!("Machine of group {} not brought up: {}", spec.group, e),
                Err(e) => tracing::warn!("Machine task of group {} failed: {}", spec.group, e),
            }
        }
        created.sort();
        created
    }

    /// Run the group's init command and, when asked, the consul agent
    pub(crate) async fn init_machine(&self, name: &str, spec: &MachineGroupSpec) -> Result<()> {
        let command = spec.init.trim();
        if !command.is_empty() {
            if let Err(e) = self.provisioner.exec(name, command).await {
                tracing::warn!("Init command on {} failed: {}", name, e);
            }
        }

        if spec.consul {
            consul::start_agent(&self.topology, self.provisioner.as_ref(), self.connector.as_ref(), name).await?;
        }
        Ok(())
    }

    /// Destroy machines above every group's maximum, one group at a time
    pub(crate) async fn scale_machines_in(&self) -> Result<()> {
        if !self.options.machine_scale_in {
            tracing::info!("Machine scale-in disabled");
            return Ok(());
        }
        for spec in &self.topology.machine.topology {
            self.scale_group_in(spec).await?;
        }
        Ok(())
    }

    async fn scale_group_in(&self, spec: &MachineGroupSpec) -> Result<()> {
        if spec.max_num == 0 {
            return Ok(());
        }

        let machines: Vec<MachineInfo> = self
            .provisioner
            .list()
            .await?
            .into_iter()
            .filter(|m| m.in_group(&spec.group))
            .collect();
        let running = machines.iter().filter(|m| m.is_running()).count();
        if running <= spec.max_num {
            tracing::debug!("Machine group {} has {} running, at most {}", spec.group, running, spec.max_num);
            return Ok(());
        }

        let victims = surplus_machines(&machines, spec.max_num);
        tracing::info!(
            "Machine group {} has {} running, at most {} allowed; destroying {:?}",
            spec.group,
            running,
            spec.max_num,
            victims.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
        );

        for machine in victims {
            if machine.is_running() {
                self.drain_machine(&machine.name).await?;
            }
            self.provisioner.destroy(&[machine.name.clone()]).await?;
            tracing::info!("Machine {} destroyed", machine.name);
        }
        Ok(())
    }

    /// Stop every running container on a machine, unregistering it first
    async fn drain_machine(&self, name: &str) -> Result<()> {
        let containers: Vec<_> = self
            .runtime
            .list(&ListFilter::all())
            .await?
            .into_iter()
            .filter(|c| c.node.as_deref() == Some(name) && c.is_up())
            .collect();
        tracing::info!("Stopping {} containers on {}", containers.len(), name);

        for container in &containers {
            let spec = container
                .group()
                .and_then(|g| self.topology.container_group(&g).cloned());
            self.stop_container(container, spec.as_ref()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;
    use crate::testing::{container, Harness};

    const TOPOLOGY: &str = r#"
cluster_by: swarm
master: master-1
master_group: master
discovery: consul://consul-1:8500/swarm
machine:
  cloud:
    aliyun:
      options: "--aliyun-region cn-beijing"
      global_options: "--debug"
      default: true
  topology:
    - group: master
      min_num: 1
    - group: web
      min_num: 3
      max_num: 3
      init: "sysctl -w vm.swappiness=0"
      driver_opts: ["--aliyun-instance-type", "ecs.t1"]
    - group: db
      min_num: 1
      max_num: 1
service_discover:
  front:
    driver: recording
    container: api
container:
  topology:
    - group: api
      image: api:1
      num: 2
      port: "8080:80"
      service_discover: front
"#;

    #[test]
    fn test_create_options() {
        let topology = crate::topology::TopologyParser::parse_str(TOPOLOGY, None).unwrap();
        let web = topology.machine_group("web").unwrap();
        let (global, create) = create_options(&topology, web, MachineRole::Slave).unwrap();
        assert_eq!(global, vec!["--debug"]);
        assert_eq!(
            create,
            vec![
                "-d",
                "aliyun",
                "--swarm",
                "--swarm-discovery",
                "consul://consul-1:8500/swarm",
                "--engine-label",
                "role=slave",
                "--engine-label",
                "group=web",
                "--aliyun-region",
                "cn-beijing",
                "--aliyun-instance-type",
                "ecs.t1",
            ]
        );

        let (_, create) = create_options(&topology, web, MachineRole::Master).unwrap();
        assert_eq!(create[3], "--swarm-master");
        assert!(create.contains(&"role=master".to_string()));
    }

    #[test]
    fn test_create_options_need_a_driver() {
        let mut topology = crate::topology::TopologyParser::parse_str(TOPOLOGY, None).unwrap();
        topology.machine.cloud.clear();
        let web = topology.machine_group("web").unwrap().clone();
        assert!(create_options(&topology, &web, MachineRole::Slave)
            .unwrap_err()
            .is_config_error());
    }

    #[test]
    fn test_master_group_fallback() {
        let mut topology = ClusterTopology {
            master: "boss-1".to_string(),
            ..Default::default()
        };
        assert_eq!(master_group(&topology), "boss");
        topology.master_group = "control".to_string();
        assert_eq!(master_group(&topology), "control");
    }

    #[tokio::test]
    async fn test_ensure_master_creates_or_starts() {
        let harness = Harness::new(TOPOLOGY, Default::default());
        ensure_master(&harness.deployment.topology, harness.provisioner.as_ref())
            .await
            .unwrap();
        let created = harness.provisioner.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "master-1");
        assert!(created[0].2.contains(&"--swarm-master".to_string()));

        let harness = Harness::new(TOPOLOGY, Default::default());
        harness.provisioner.add("master-1", MachineState::Stopped);
        ensure_master(&harness.deployment.topology, harness.provisioner.as_ref())
            .await
            .unwrap();
        assert_eq!(harness.log.events(), vec!["machine.start master-1"]);
        assert!(harness.provisioner.created().is_empty());
    }

    #[tokio::test]
    async fn test_scale_out_starts_stopped_first() {
        let harness = Harness::new(TOPOLOGY, harness_options());
        harness.provisioner.add("web-1", MachineState::Running);
        harness.provisioner.add("web-2", MachineState::Stopped);
        harness.provisioner.add("web-3", MachineState::Stopped);
        harness.provisioner.add("db-1", MachineState::Running);
        harness.provisioner.add("master-1", MachineState::Running);

        harness.deployment.scale_machines_out().await.unwrap();

        assert_eq!(harness.log.count("machine.start"), 2);
        assert_eq!(harness.log.count("machine.create"), 0);
        assert_eq!(harness.provisioner.running("web").len(), 3);
    }

    #[tokio::test]
    async fn test_scale_out_creates_when_start_fails() {
        let harness = Harness::new(TOPOLOGY, harness_options());
        harness.provisioner.add("web-1", MachineState::Running);
        harness.provisioner.add("web-2", MachineState::Stopped);
        harness.provisioner.add("web-3", MachineState::Stopped);
        harness.provisioner.add("db-1", MachineState::Running);
        harness.provisioner.add("master-1", MachineState::Running);
        harness.provisioner.fail_start("web-2");
        harness.deployment.machine_seqs.observe_name("web-3").unwrap();

        harness.deployment.scale_machines_out().await.unwrap();

        assert_eq!(harness.log.count("machine.start"), 2);
        let created: Vec<String> = harness.provisioner.created().into_iter().map(|c| c.0).collect();
        assert_eq!(created, vec!["web-4"]);
        let mut running = harness.provisioner.running("web");
        running.sort();
        assert_eq!(running, vec!["web-1", "web-3", "web-4"]);
    }

    #[tokio::test]
    async fn test_scale_out_creates_next_names() {
        let harness = Harness::new(TOPOLOGY, harness_options());
        harness.provisioner.add("web-4", MachineState::Running);
        harness.provisioner.add("db-1", MachineState::Running);
        harness.provisioner.add("master-1", MachineState::Running);
        harness.deployment.machine_seqs.observe_name("web-4").unwrap();

        harness.deployment.scale_machines_out().await.unwrap();

        let mut created: Vec<String> = harness.provisioner.created().into_iter().map(|c| c.0).collect();
        created.sort();
        assert_eq!(created, vec!["web-5", "web-6"]);
        assert_eq!(harness.log.count("machine.exec web-"), 2);
        assert_eq!(harness.provisioner.running("web").len(), 3);
    }

    #[tokio::test]
    async fn test_scale_out_reports_shortfall() {
        let harness = Harness::new(TOPOLOGY, harness_options());
        harness.provisioner.add("db-1", MachineState::Running);
        harness.provisioner.fail_create("web-2");

        let err = harness.deployment.scale_machines_out().await.unwrap_err();
        match err {
            ArmadaError::CapacityShortfall { group, running, required } => {
                assert_eq!(group, "web");
                assert_eq!(running, 2);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error: {}", other),
        }

        let degraded = Harness::new(
            TOPOLOGY,
            crate::cluster::DeployOptions {
                allow_degraded: true,
                ..harness_options()
            },
        );
        degraded.provisioner.add("db-1", MachineState::Running);
        degraded.provisioner.fail_create("web-1");
        assert!(degraded.deployment.scale_machines_out().await.is_ok());
    }

    #[test]
    fn test_surplus_prefers_stopped_then_lowest_seq() {
        let harness = Harness::new(TOPOLOGY, Default::default());
        for (name, state) in [
            ("web-7", MachineState::Running),
            ("web-2", MachineState::Running),
            ("web-5", MachineState::Stopped),
            ("web-3", MachineState::Running),
            ("master-1", MachineState::Running),
        ] {
            harness.provisioner.add(name, state);
        }
        let machines = harness.provisioner.machines();
        let victims: Vec<String> = surplus_machines(&machines, 3).into_iter().map(|m| m.name).collect();
        assert_eq!(victims, vec!["web-5", "web-2"]);
    }

    #[tokio::test]
    async fn test_scale_in_drains_before_destroy() {
        let harness = Harness::new(TOPOLOGY, harness_options());
        for name in ["web-1", "web-2", "web-3", "web-4"] {
            harness.provisioner.add(name, MachineState::Running);
        }
        harness.runtime.add(container("api-1", "api:1", "web-1", "10.0.0.1"));
        harness.runtime.add(container("api-2", "api:1", "web-2", "10.0.0.2"));

        harness.deployment.scale_machines_in().await.unwrap();

        let events = harness.log.events();
        assert_eq!(
            events,
            vec!["unregister 10.0.0.1:20001", "stop api-1", "machine.destroy web-1"]
        );
        assert_eq!(harness.provisioner.running("web").len(), 3);
    }

    fn harness_options() -> crate::cluster::DeployOptions {
        crate::cluster::DeployOptions {
            machine_scale_in: true,
            machine_scale_out: true,
            ..Default::default()
        }
    }
}
