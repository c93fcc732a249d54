//! In-memory collaborators shared by the unit tests

use crate::cluster::context::Deployment;
use crate::cluster::inventory::Inventory;
use crate::cluster::services::ServiceCoordinator;
use crate::cluster::DeployOptions;
use crate::container::{
    ContainerInfo, ContainerRuntime, FilterChain, ListFilter, PublishedPort, RunConfig, RuntimeConnector,
};
use crate::discovery::ServiceRegisterDriver;
use crate::error::{ArmadaError, Result};
use crate::machine::{MachineInfo, MachineProvisioner, MachineState, StartOutcome};
use crate::naming::ResourceName;
use crate::sequence::SequenceRegistry;
use crate::topology::TopologyParser;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of side effects across every fake
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn index_of(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// A running container of `name` on `node`, publishing port 80
pub fn container(name: &str, image: &str, node: &str, ip: &str) -> ContainerInfo {
    let seq = ResourceName::parse(name).map(|n| n.seq).unwrap_or(0);
    ContainerInfo {
        id: format!("id-{}", name),
        name: name.to_string(),
        node: Some(node.to_string()),
        image: image.to_string(),
        status: "Up 5 minutes".to_string(),
        ports: vec![PublishedPort {
            ip: ip.to_string(),
            public_port: 20000 + seq as u16,
            private_port: 80,
            protocol: "tcp".to_string(),
        }],
        created: Utc.timestamp_opt(1_600_000_000 + seq as i64, 0).single().unwrap(),
    }
}

/// Machine provisioner keeping its machines in memory
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    log: EventLog,
    master: String,
    machines: Mutex<Vec<MachineInfo>>,
    created: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
    fail_create: Mutex<HashSet<String>>,
    fail_start: Mutex<HashSet<String>>,
    next_ip: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new(log: EventLog, master: &str) -> Self {
        Self {
            log,
            master: master.to_string(),
            next_ip: AtomicUsize::new(100),
            ..Default::default()
        }
    }

    pub fn add(&self, name: &str, state: MachineState) {
        let ip = self.allocate_ip();
        self.machines.lock().unwrap().push(MachineInfo {
            name: name.to_string(),
            driver: "fake".to_string(),
            active: false,
            state,
            url: format!("tcp://{}:2376", ip),
            ip,
            master: self.master.clone(),
        });
    }

    pub fn fail_create(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.fail_start.lock().unwrap().insert(name.to_string());
    }

    pub fn machines(&self) -> Vec<MachineInfo> {
        self.machines.lock().unwrap().clone()
    }

    pub fn running(&self, group: &str) -> Vec<String> {
        self.machines()
            .into_iter()
            .filter(|m| m.in_group(group) && m.is_running())
            .map(|m| m.name)
            .collect()
    }

    /// `(name, global options, create options)` of every create call
    pub fn created(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.created.lock().unwrap().clone()
    }

    fn allocate_ip(&self) -> String {
        format!("10.0.0.{}", self.next_ip.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl MachineProvisioner for FakeProvisioner {
    async fn list(&self) -> Result<Vec<MachineInfo>> {
        Ok(self.machines())
    }

    async fn create(&self, name: &str, global_opts: &[String], create_opts: &[String]) -> Result<()> {
        self.log.push(format!("machine.create {}", name));
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), global_opts.to_vec(), create_opts.to_vec()));
        if self.fail_create.lock().unwrap().contains(name) {
            return Err(ArmadaError::Machine(format!("quota exceeded creating {}", name)));
        }
        self.add(name, MachineState::Running);
        Ok(())
    }

    async fn start(&self, names: &[String]) -> StartOutcome {
        let mut outcome = StartOutcome::default();
        let mut errors = Vec::new();
        for name in names {
            self.log.push(format!("machine.start {}", name));
            if self.fail_start.lock().unwrap().contains(name) {
                errors.push(ArmadaError::Machine(format!("{} did not boot", name)));
                continue;
            }
            let mut machines = self.machines.lock().unwrap();
            match machines.iter_mut().find(|m| &m.name == name) {
                Some(machine) => {
                    machine.state = MachineState::Running;
                    outcome.succeeded.push(name.clone());
                }
                None => errors.push(ArmadaError::MachineNotFound(name.clone())),
            }
        }
        outcome.error = ArmadaError::collect("start machines", errors).err();
        outcome
    }

    async fn destroy(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.log.push(format!("machine.destroy {}", name));
            self.machines.lock().unwrap().retain(|m| &m.name != name);
        }
        Ok(())
    }

    async fn exec(&self, machine: &str, command: &str) -> Result<()> {
        self.log.push(format!("machine.exec {} {}", machine, command));
        Ok(())
    }

    async fn ip(&self, machine: &str) -> Result<String> {
        self.machines()
            .into_iter()
            .find(|m| m.name == machine)
            .map(|m| m.ip)
            .ok_or_else(|| ArmadaError::MachineNotFound(machine.to_string()))
    }

    async fn engine_config(&self, machine: &str, swarm: bool) -> Result<String> {
        let ip = self.ip(machine).await?;
        let port = if swarm { 3376 } else { 2376 };
        Ok(format!("--tlsverify -H=tcp://{}:{}", ip, port))
    }
}

/// Container runtime keeping its containers in memory.
///
/// `stop` marks a container as being cycled and `start`/`restart` clears
/// the mark, so `max_in_flight` is the most containers ever down at once.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    log: EventLog,
    containers: Mutex<Vec<ContainerInfo>>,
    runs: Mutex<Vec<RunConfig>>,
    fail_restart: Mutex<HashSet<String>>,
    fail_start: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
    stop_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn add(&self, info: ContainerInfo) {
        self.containers.lock().unwrap().push(info);
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    pub fn fail_restart(&self, name: &str) {
        self.fail_restart.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.fail_start.lock().unwrap().insert(name.to_string());
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.containers.lock().unwrap().clone()
    }

    pub fn get_by_name(&self, name: &str) -> Option<ContainerInfo> {
        self.containers().into_iter().find(|c| c.name == name)
    }

    pub fn running(&self, group: &str) -> Vec<ContainerInfo> {
        self.containers()
            .into_iter()
            .filter(|c| c.group().as_deref() == Some(group) && c.is_up())
            .collect()
    }

    /// Every config passed to `create`
    pub fn runs(&self) -> Vec<RunConfig> {
        self.runs.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn name_of(&self, id: &str) -> Result<String> {
        self.containers()
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.name)
            .ok_or_else(|| ArmadaError::ContainerNotFound(id.to_string()))
    }

    fn set_status(&self, id: &str, status: &str) {
        if let Some(c) = self.containers.lock().unwrap().iter_mut().find(|c| c.id == id) {
            c.status = status.to_string();
        }
    }

    fn settle(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerInfo>> {
        filter.apply(self.containers())
    }

    async fn create(&self, config: &RunConfig) -> Result<String> {
        self.log.push(format!("create {}", config.name));
        self.runs.lock().unwrap().push(config.clone());

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let node = config
            .env
            .iter()
            .find_map(|e| e.strip_prefix("constraint:node=="))
            .unwrap_or("node-0")
            .to_string();
        let ip = "10.9.0.1".to_string();

        let id = format!("new-{}", n);
        self.add(ContainerInfo {
            id: id.clone(),
            name: config.name.clone(),
            node: Some(node),
            image: config.image.clone(),
            status: "Created".to_string(),
            ports: config
                .port_bindings
                .iter()
                .map(|b| PublishedPort {
                    ip: ip.clone(),
                    public_port: b.host_port,
                    private_port: b.container_port,
                    protocol: b.protocol.clone(),
                })
                .collect(),
            created: Utc::now() + ChronoDuration::seconds(n as i64),
        });
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.log.push(format!("start {}", name));
        if self.fail_start.lock().unwrap().contains(&name) {
            return Err(ArmadaError::Container(format!("{} failed to start", name)));
        }
        self.set_status(id, "Up 1 second");
        self.settle();
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.push(format!("stop {}", name));

        let delay = *self.stop_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.set_status(id, "Exited (0) 1 second ago");
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.log.push(format!("restart {}", name));
        if self.fail_restart.lock().unwrap().contains(&name) {
            return Err(ArmadaError::Container(format!("{} failed to restart", name)));
        }
        self.set_status(id, "Up 1 second");
        self.settle();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.log.push(format!("remove {}", name));
        self.containers.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }
}

/// Connector handing out one shared fake runtime
pub struct FakeConnector {
    log: EventLog,
    runtime: Arc<FakeRuntime>,
}

impl FakeConnector {
    pub fn new(log: EventLog, runtime: Arc<FakeRuntime>) -> Self {
        Self { log, runtime }
    }
}

#[async_trait]
impl RuntimeConnector for FakeConnector {
    async fn connect(&self, machine: &str, swarm: bool) -> Result<Arc<dyn ContainerRuntime>> {
        if swarm {
            self.log.push(format!("connect {} swarm", machine));
        } else {
            self.log.push(format!("connect {}", machine));
        }
        Ok(self.runtime.clone())
    }
}

/// Discovery driver that only records calls
#[derive(Debug)]
pub struct RecordingDriver {
    name: String,
    log: EventLog,
    fail: AtomicBool,
}

impl RecordingDriver {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail: AtomicBool::new(false),
        }
    }

    /// Driver with a log of its own
    pub fn detached(name: &str) -> Self {
        Self::new(name, EventLog::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ArmadaError::Discovery(format!("{} unavailable", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRegisterDriver for RecordingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn registry(&self, urls: Vec<String>) -> Result<()> {
        self.log.push(format!("registry {} {}", self.name, urls.join(",")));
        self.check()
    }

    async fn register(&self, host: &str, port: u16) -> Result<()> {
        self.log.push(format!("register {}:{}", host, port));
        self.check()
    }

    async fn unregister(&self, host: &str, port: u16) -> Result<()> {
        self.log.push(format!("unregister {}:{}", host, port));
        self.check()
    }
}

/// A deployment wired to fakes sharing one event log; every declared
/// backend gets a [`RecordingDriver`]
pub struct Harness {
    pub log: EventLog,
    pub provisioner: Arc<FakeProvisioner>,
    pub runtime: Arc<FakeRuntime>,
    pub deployment: Arc<Deployment>,
}

impl Harness {
    pub fn new(topology: &str, options: DeployOptions) -> Self {
        let topology = TopologyParser::parse_str(topology, None).unwrap();
        let log = EventLog::default();
        let provisioner = Arc::new(FakeProvisioner::new(log.clone(), &topology.master));
        let runtime = Arc::new(FakeRuntime::new(log.clone()));
        let connector = Arc::new(FakeConnector::new(log.clone(), runtime.clone()));

        let mut services = ServiceCoordinator::new();
        for backend in topology.service_discover.keys() {
            services.insert(backend, Arc::new(RecordingDriver::new(backend, log.clone())));
        }
        let filters = FilterChain::from_pairs(options.filters.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();

        let deployment = Arc::new(Deployment {
            topology,
            options,
            provisioner: provisioner.clone(),
            connector,
            runtime: runtime.clone(),
            services,
            filters,
            machine_seqs: Arc::new(SequenceRegistry::new()),
            container_seqs: Arc::new(SequenceRegistry::new()),
            inventory: Arc::new(Inventory::new()),
        });

        Self {
            log,
            provisioner,
            runtime,
            deployment,
        }
    }
}
