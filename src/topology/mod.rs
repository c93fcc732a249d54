//! Declared cluster topology
//!
//! Loads the topology file, applies the selected profile, expands
//! multi-port groups and parses every port binding before the deploy sees
//! the data.

pub mod config;
pub mod parser;
pub mod port;

pub use config::{
    CloudDriver, ClusterTopology, ConsulDescription, ContainerGroupSpec, MachineGroupSpec,
    ServiceDiscoverDescription,
};
pub use parser::{ClusterProfiles, Profile, TopologyParser};
pub use port::PortBinding;
