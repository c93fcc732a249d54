//! Live machine and container snapshots

use crate::container::ContainerInfo;
use crate::error::{ArmadaError, Result};
use crate::machine::MachineInfo;
use std::sync::RwLock;

/// Last observed machines and containers.
///
/// Snapshots are replaced whole after a mutating batch; readers during a
/// batch may see the previous snapshot.
#[derive(Debug, Default)]
pub struct Inventory {
    machines: RwLock<Vec<MachineInfo>>,
    containers: RwLock<Vec<ContainerInfo>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_machines(&self, machines: Vec<MachineInfo>) -> Result<()> {
        let mut current = self
            .machines
            .write()
            .map_err(|_| ArmadaError::Lock("Failed to acquire write lock".to_string()))?;
        *current = machines;
        Ok(())
    }

    pub fn replace_containers(&self, containers: Vec<ContainerInfo>) -> Result<()> {
        let mut current = self
            .containers
            .write()
            .map_err(|_| ArmadaError::Lock("Failed to acquire write lock".to_string()))?;
        *current = containers;
        Ok(())
    }

    pub fn machines(&self) -> Result<Vec<MachineInfo>> {
        self.machines
            .read()
            .map(|m| m.clone())
            .map_err(|_| ArmadaError::Lock("Failed to acquire read lock".to_string()))
    }

    pub fn containers(&self) -> Result<Vec<ContainerInfo>> {
        self.containers
            .read()
            .map(|c| c.clone())
            .map_err(|_| ArmadaError::Lock("Failed to acquire read lock".to_string()))
    }

    /// Machine by name
    pub fn machine(&self, name: &str) -> Result<Option<MachineInfo>> {
        Ok(self.machines()?.into_iter().find(|m| m.name == name))
    }

    /// Machines of a group, master excluded
    pub fn machines_in_group(&self, group: &str) -> Result<Vec<MachineInfo>> {
        Ok(self
            .machines()?
            .into_iter()
            .filter(|m| m.in_group(group) && !m.is_master())
            .collect())
    }

    /// Containers of a group
    pub fn containers_in_group(&self, group: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .containers()?
            .into_iter()
            .filter(|c| c.group().as_deref() == Some(group))
            .collect())
    }

    /// Containers placed on a machine
    pub fn containers_on_node(&self, node: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .containers()?
            .into_iter()
            .filter(|c| c.node.as_deref() == Some(node))
            .collect())
    }
}
