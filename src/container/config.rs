//! Container state and run configuration

use crate::error::{ArmadaError, Result};
use crate::naming::ResourceName;
use crate::topology::PortBinding;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A published port of a live container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    /// Host address the port is published on
    pub ip: String,
    /// Host port
    pub public_port: u16,
    /// Container port
    pub private_port: u16,
    /// `tcp` or `udp`
    pub protocol: String,
}

/// A live container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Bare name, `{group}-{seq}`
    pub name: String,
    /// Machine the container runs on, when the runtime reports it
    pub node: Option<String>,
    /// Image the container was created from
    pub image: String,
    /// Runtime status line, such as `Up 3 minutes`
    pub status: String,
    /// Published ports
    pub ports: Vec<PublishedPort>,
    /// Creation time
    pub created: DateTime<Utc>,
}

impl ContainerInfo {
    /// Whether the container is running and not paused
    pub fn is_up(&self) -> bool {
        self.status.starts_with("Up") && !self.status.contains("(Paused)")
    }

    /// Group and sequence encoded in the name
    pub fn resource_name(&self) -> Option<ResourceName> {
        ResourceName::parse(&self.name)
    }

    /// Group the container belongs to
    pub fn group(&self) -> Option<String> {
        self.resource_name().map(|n| n.group)
    }

    /// Published port for a container port
    pub fn port_for(&self, private_port: u16) -> Option<&PublishedPort> {
        self.ports.iter().find(|p| p.private_port == private_port)
    }

    /// First published IP
    pub fn first_ip(&self) -> Option<&str> {
        self.ports.first().map(|p| p.ip.as_str())
    }
}

/// Restart policy of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// `always`, `on-failure` or `no`
    pub name: String,
    /// Retries for `on-failure`
    pub max_retry: u32,
}

impl RestartPolicy {
    /// Always restart
    pub fn always() -> Self {
        Self {
            name: "always".to_string(),
            max_retry: 0,
        }
    }
}

/// Everything needed to create and start one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub image: String,
    pub port_bindings: Vec<PortBinding>,
    /// `KEY=value` environment
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub hostname: Option<String>,
    /// Bind mounts, `host:container[:mode]`
    pub binds: Vec<String>,
    /// DNS servers
    pub dns: Vec<String>,
    pub restart_policy: Option<RestartPolicy>,
}

/// Selects containers when listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Regular expression the bare name must match
    pub name_pattern: Option<String>,
}

impl ListFilter {
    /// Every container
    pub fn all() -> Self {
        Self::default()
    }

    /// Containers named `{group}-{n}`
    pub fn group(group: &str) -> Self {
        Self {
            name_pattern: Some(format!("^{}-[0-9]*$", regex::escape(group))),
        }
    }

    /// Keep the containers whose bare name matches
    pub fn apply(&self, containers: Vec<ContainerInfo>) -> Result<Vec<ContainerInfo>> {
        match &self.name_pattern {
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|e| ArmadaError::InvalidConfig(e.to_string()))?;
                Ok(containers.into_iter().filter(|c| re.is_match(&c.name)).collect())
            }
            None => Ok(containers),
        }
    }
}
