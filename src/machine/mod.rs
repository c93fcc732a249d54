//! Machine provisioning
//!
//! [`MachineProvisioner`] is the seam between the machine controller and
//! whatever creates hosts. [`DockerMachine`] drives the `docker-machine` CLI.

pub mod docker_machine;

pub use docker_machine::DockerMachine;

use crate::error::{ArmadaError, Result};
use crate::naming::ResourceName;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine state as reported by the provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Error,
    Unknown,
}

impl MachineState {
    /// Parse a state column, case insensitive
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "running" => MachineState::Running,
            "stopped" | "saved" | "paused" => MachineState::Stopped,
            "starting" => MachineState::Starting,
            "stopping" => MachineState::Stopping,
            "error" => MachineState::Error,
            _ => MachineState::Unknown,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Running => write!(f, "Running"),
            MachineState::Stopped => write!(f, "Stopped"),
            MachineState::Starting => write!(f, "Starting"),
            MachineState::Stopping => write!(f, "Stopping"),
            MachineState::Error => write!(f, "Error"),
            MachineState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A live machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub name: String,
    pub driver: String,
    /// Whether this is the provisioner's active machine
    pub active: bool,
    pub state: MachineState,
    /// Engine URL, `tcp://{ip}:2376`
    pub url: String,
    pub ip: String,
    /// Swarm master this machine reports to
    pub master: String,
}

impl MachineInfo {
    /// Whether the machine is running
    pub fn is_running(&self) -> bool {
        self.state == MachineState::Running
    }

    /// Whether the machine is its own swarm master
    pub fn is_master(&self) -> bool {
        !self.master.is_empty() && self.name == self.master
    }

    /// Group and sequence encoded in the name
    pub fn resource_name(&self) -> Option<ResourceName> {
        ResourceName::parse(&self.name)
    }

    /// Whether the machine belongs to `group`
    pub fn in_group(&self, group: &str) -> bool {
        self.resource_name().map_or(false, |n| n.group == group)
    }
}

/// Result of starting a batch of machines
#[derive(Debug, Default)]
pub struct StartOutcome {
    /// Machines that started
    pub succeeded: Vec<String>,
    /// Combined error of the machines that did not
    pub error: Option<ArmadaError>,
}

/// Creates, starts and destroys machines
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    /// List every machine known to the provisioner
    async fn list(&self) -> Result<Vec<MachineInfo>>;

    /// Create and start a machine
    async fn create(&self, name: &str, global_opts: &[String], create_opts: &[String]) -> Result<()>;

    /// Start stopped machines; partial success is reported, not failed
    async fn start(&self, names: &[String]) -> StartOutcome;

    /// Destroy machines
    async fn destroy(&self, names: &[String]) -> Result<()>;

    /// Run a shell command on a machine
    async fn exec(&self, machine: &str, command: &str) -> Result<()>;

    /// Public address of a machine
    async fn ip(&self, machine: &str) -> Result<String>;

    /// Engine connection line for a machine, the swarm endpoint when `swarm` is set
    async fn engine_config(&self, machine: &str, swarm: bool) -> Result<String>;
}
