//! Container selection for partial deploys

use super::config::{ContainerInfo, ListFilter};
use crate::error::{ArmadaError, Result};

const LIST_SEPARATOR: char = ',';

/// One `--c-filter` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFilter {
    /// Containers of one group
    Group(String),
    /// Containers whose first published IP is listed
    Ip(Vec<String>),
    /// Containers on one of the listed machines
    Machine(Vec<String>),
    /// The first `n * p / 100` containers, rounded down
    Percent(u32),
}

impl ContainerFilter {
    /// Parse a `key` and `value` pair
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        let list = || -> Vec<String> {
            value
                .split(LIST_SEPARATOR)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        match key.trim() {
            "group" => Ok(ContainerFilter::Group(value.trim().to_string())),
            "ip" => Ok(ContainerFilter::Ip(list())),
            "machine" => Ok(ContainerFilter::Machine(list())),
            "percent" => {
                let percent: u32 = value
                    .trim()
                    .trim_end_matches('%')
                    .parse()
                    .map_err(|_| ArmadaError::InvalidConfig(format!("Bad percent filter '{}'", value)))?;
                if percent > 100 {
                    return Err(ArmadaError::InvalidConfig(format!(
                        "Percent filter {} exceeds 100",
                        percent
                    )));
                }
                Ok(ContainerFilter::Percent(percent))
            }
            other => Err(ArmadaError::InvalidConfig(format!("Unknown container filter '{}'", other))),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ContainerFilter::Group(_) => 0,
            ContainerFilter::Machine(_) => 1,
            ContainerFilter::Ip(_) => 2,
            ContainerFilter::Percent(_) => 3,
        }
    }

    fn apply(&self, containers: Vec<ContainerInfo>) -> Result<Vec<ContainerInfo>> {
        let selected = match self {
            ContainerFilter::Group(group) => ListFilter::group(group).apply(containers)?,
            ContainerFilter::Ip(ips) => containers
                .into_iter()
                .filter(|c| c.first_ip().map_or(false, |ip| ips.iter().any(|i| i == ip)))
                .collect(),
            ContainerFilter::Machine(machines) => containers
                .into_iter()
                .filter(|c| c.node.as_ref().map_or(false, |n| machines.contains(n)))
                .collect(),
            ContainerFilter::Percent(percent) => {
                let keep = containers.len() * (*percent as usize) / 100;
                containers.into_iter().take(keep).collect()
            }
        };
        Ok(selected)
    }
}

/// Split command line `key=value` strings
pub fn parse_pairs(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ArmadaError::InvalidConfig(format!("Filter '{}' is not key=value", arg)))
        })
        .collect()
}

/// Ordered set of container filters, group first and percent last
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<ContainerFilter>,
}

impl FilterChain {
    /// Build a chain from `key=value` pairs; a non-empty chain needs a group
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filters = pairs
            .into_iter()
            .map(|(k, v)| ContainerFilter::parse(k.as_ref(), v.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        if !filters.is_empty() && !filters.iter().any(|f| matches!(f, ContainerFilter::Group(_))) {
            return Err(ArmadaError::InvalidConfig(
                "Container filters require a 'group' filter".to_string(),
            ));
        }

        filters.sort_by_key(ContainerFilter::rank);
        Ok(Self { filters })
    }

    /// Parse `key=value` strings as given on the command line
    pub fn from_args(args: &[String]) -> Result<Self> {
        Self::from_pairs(parse_pairs(args)?)
    }

    /// Whether no filter is set
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Group the chain is narrowed to
    pub fn group(&self) -> Option<&str> {
        self.filters.iter().find_map(|f| match f {
            ContainerFilter::Group(g) => Some(g.as_str()),
            _ => None,
        })
    }

    /// Reject scaling while more than one filter narrows the selection
    pub fn check_scaling(&self, scale_in: bool, scale_out: bool) -> Result<()> {
        if self.filters.len() > 1 && (scale_in || scale_out) {
            return Err(ArmadaError::InvalidConfig(
                "Container scale-in/out cannot be combined with several filters".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply every filter in order
    pub fn apply(&self, containers: Vec<ContainerInfo>) -> Result<Vec<ContainerInfo>> {
        let mut selected = containers;
        for filter in &self.filters {
            selected = filter.apply(selected)?;
            tracing::debug!("Filter {:?} kept {} containers", filter, selected.len());
        }
        Ok(selected)
    }
}
