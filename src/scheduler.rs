//! Dependency graph scheduler
//!
//! Groups are stored in an arena indexed by declaration order. Levels are
//! assigned by a depth-first walk that tracks the nodes on the current path,
//! so a cycle is reported before any level is handed to a caller.

use crate::error::{ArmadaError, Result};
use std::collections::{BTreeMap, HashMap};

/// Direction in which levels are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    /// Leaves first, deepest dependents last
    DependenciesFirst,
    /// Deepest dependents first, leaves last
    DependentsFirst,
}

#[derive(Debug, Clone)]
struct Node {
    group: String,
    deps: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    Unvisited,
    Visiting,
    Done(usize),
}

/// Graph of groups and the groups they depend on
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a group and the groups it depends on.
    ///
    /// Declaring the same group twice appends to its dependency list.
    pub fn add<S: AsRef<str>>(&mut self, group: &str, deps: &[S]) {
        let idx = match self.index.get(group) {
            Some(idx) => *idx,
            None => {
                self.nodes.push(Node {
                    group: group.to_string(),
                    deps: Vec::new(),
                });
                self.index.insert(group.to_string(), self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };

        let node = &mut self.nodes[idx];
        for dep in deps {
            let dep = dep.as_ref();
            if !node.deps.iter().any(|d| d == dep) {
                node.deps.push(dep.to_string());
            }
        }
    }

    /// Whether a group is declared
    pub fn contains(&self, group: &str) -> bool {
        self.index.contains_key(group)
    }

    /// Number of declared groups
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no groups
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Compute the level of every group.
    ///
    /// Leaves are level 1 and every other group sits one above its deepest
    /// dependency. Returns the levels in ascending order, each holding its
    /// groups in declaration order.
    pub fn levels(&self) -> Result<Vec<(usize, Vec<String>)>> {
        let resolved = self.resolve()?;
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();

        for idx in 0..self.nodes.len() {
            self.assign_level(idx, &resolved, &mut marks, &mut path)?;
        }

        let mut by_level: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (idx, mark) in marks.iter().enumerate() {
            if let Mark::Done(level) = mark {
                by_level
                    .entry(*level)
                    .or_default()
                    .push(self.nodes[idx].group.clone());
            }
        }

        Ok(by_level.into_iter().collect())
    }

    /// Levels in the requested order, without their level numbers
    pub fn ordered_levels(&self, order: VisitOrder) -> Result<Vec<Vec<String>>> {
        let mut levels: Vec<Vec<String>> =
            self.levels()?.into_iter().map(|(_, groups)| groups).collect();
        if order == VisitOrder::DependentsFirst {
            levels.reverse();
        }
        Ok(levels)
    }

    /// Invoke `visit` once per level with every group at that level.
    ///
    /// A cycle or missing dependency fails before the first call. When
    /// `continue_on_error` is set, visit failures are collected and returned
    /// together after the last level.
    pub fn visit_by_level<F>(&self, order: VisitOrder, continue_on_error: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(usize, &[String]) -> Result<()>,
    {
        let mut levels = self.levels()?;
        if order == VisitOrder::DependentsFirst {
            levels.reverse();
        }

        let mut errors = Vec::new();
        for (level, groups) in &levels {
            if let Err(e) = visit(*level, groups) {
                if !continue_on_error {
                    return Err(e);
                }
                tracing::warn!("Level {} failed, continuing: {}", level, e);
                errors.push(e);
            }
        }

        ArmadaError::collect("visit levels", errors)
    }

    /// All groups, leaves first
    pub fn list(&self) -> Result<Vec<String>> {
        let mut all = Vec::with_capacity(self.nodes.len());
        self.visit_by_level(VisitOrder::DependenciesFirst, true, |_, groups| {
            all.extend(groups.iter().cloned());
            Ok(())
        })?;
        Ok(all)
    }

    fn resolve(&self) -> Result<Vec<Vec<usize>>> {
        self.nodes
            .iter()
            .map(|node| {
                node.deps
                    .iter()
                    .map(|dep| {
                        self.index
                            .get(dep)
                            .copied()
                            .ok_or_else(|| ArmadaError::MissingDependency {
                                group: node.group.clone(),
                                dependency: dep.clone(),
                            })
                    })
                    .collect()
            })
            .collect()
    }

    fn assign_level(
        &self,
        idx: usize,
        resolved: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Result<usize> {
        match marks[idx] {
            Mark::Done(level) => return Ok(level),
            Mark::Visiting => {
                let start = path.iter().position(|&p| p == idx).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..]
                    .iter()
                    .map(|&p| self.nodes[p].group.as_str())
                    .collect();
                cycle.push(self.nodes[idx].group.as_str());
                return Err(ArmadaError::DependencyCycle(cycle.join(" -> ")));
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::Visiting;
        path.push(idx);

        let mut level = 1;
        for &dep in &resolved[idx] {
            level = level.max(1 + self.assign_level(dep, resolved, marks, path)?);
        }

        path.pop();
        marks[idx] = Mark::Done(level);
        Ok(level)
    }
}
