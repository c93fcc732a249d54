//! Armada - declared-state deployment for clusters of machines and containers
//!
//! Armada reads a cluster topology and reconciles it against live state:
//!
//! - Machine groups kept between their minimum and maximum size
//! - Container groups rolled, scaled and cleaned in dependency order
//! - Service registration with pluggable discovery backends
//! - Consul server bootstrap and per-machine agents

pub mod cluster;
pub mod command;
pub mod container;
pub mod discovery;
pub mod error;
pub mod machine;
pub mod naming;
pub mod scheduler;
pub mod sequence;
pub mod topology;

#[cfg(test)]
mod testing;

pub use error::{ArmadaError, Result};
