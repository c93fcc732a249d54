//! Deploy ordering of container groups

use crate::error::{ArmadaError, Result};
use crate::scheduler::{DependencyGraph, VisitOrder};
use crate::topology::ClusterTopology;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Container groups by level, dependencies first.
///
/// Discovery groups (the groups backends track, with everything they depend
/// on) are deployed before any business group and never appear twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployPlan {
    pub discovery_levels: Vec<Vec<String>>,
    pub business_levels: Vec<Vec<String>>,
}

impl DeployPlan {
    /// Build both graphs and order them; fails on a cycle or undeclared group
    pub fn build(topology: &ClusterTopology) -> Result<Self> {
        let discovery = discovery_graph(topology)?;
        let discovery_levels = discovery.ordered_levels(VisitOrder::DependenciesFirst)?;
        let discovery_groups: HashSet<&str> = discovery_levels.iter().flatten().map(String::as_str).collect();

        let business = business_graph(topology)?;
        let business_levels = business
            .ordered_levels(VisitOrder::DependenciesFirst)?
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .filter(|g| !discovery_groups.contains(g.as_str()))
                    .collect::<Vec<_>>()
            })
            .filter(|level| !level.is_empty())
            .collect();

        Ok(Self {
            discovery_levels,
            business_levels,
        })
    }

    /// Whether a group is deployed with the discovery levels
    pub fn is_discovery_group(&self, group: &str) -> bool {
        self.discovery_levels.iter().flatten().any(|g| g == group)
    }

    /// Every group in deploy order
    pub fn groups(&self) -> impl Iterator<Item = &String> {
        self.discovery_levels
            .iter()
            .chain(self.business_levels.iter())
            .flatten()
    }
}

impl fmt::Display for DeployPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Discovery groups:")?;
        for (idx, level) in self.discovery_levels.iter().enumerate() {
            writeln!(f, "  level {}: {}", idx + 1, level.join(", "))?;
        }
        writeln!(f, "Business groups:")?;
        for (idx, level) in self.business_levels.iter().enumerate() {
            writeln!(f, "  level {}: {}", idx + 1, level.join(", "))?;
        }
        Ok(())
    }
}

fn discovery_graph(topology: &ClusterTopology) -> Result<DependencyGraph> {
    let mut backends: Vec<&String> = topology.service_discover.keys().collect();
    backends.sort();

    let mut graph = DependencyGraph::new();
    for backend in backends {
        let target = topology.discovery_target(backend).ok_or_else(|| {
            ArmadaError::InvalidConfig(format!("Discovery backend '{}' names no container group", backend))
        })?;
        add_with_deps(&mut graph, topology, target, None)?;
    }
    Ok(graph)
}

fn business_graph(topology: &ClusterTopology) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for spec in &topology.container.topology {
        graph.add(&spec.group, &spec.deps);
        if spec.registers_service() {
            match topology.discovery_target(&spec.service_discover) {
                Some(target) if target != spec.group => graph.add(&spec.group, &[target]),
                Some(_) => {}
                None => return Err(ArmadaError::UnknownDriver(spec.service_discover.clone())),
            }
        }
    }
    Ok(graph)
}

fn add_with_deps(
    graph: &mut DependencyGraph,
    topology: &ClusterTopology,
    group: &str,
    parent: Option<&str>,
) -> Result<()> {
    if graph.contains(group) {
        return Ok(());
    }
    let spec = topology.container_group(group).ok_or_else(|| match parent {
        Some(parent) => ArmadaError::MissingDependency {
            group: parent.to_string(),
            dependency: group.to_string(),
        },
        None => ArmadaError::GroupNotFound(group.to_string()),
    })?;

    graph.add(group, &spec.deps);
    for dep in &spec.deps {
        add_with_deps(graph, topology, dep, Some(group))?;
    }
    Ok(())
}
