//! Error types for Armada

use thiserror::Error;

/// Result type for Armada operations
pub type Result<T> = std::result::Result<T, ArmadaError>;

/// Armada error types
#[derive(Error, Debug)]
pub enum ArmadaError {
    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Dependency group '{dependency}' of '{group}' is not declared")]
    MissingDependency { group: String, dependency: String },

    #[error("Invalid port binding: {0}")]
    InvalidPortBinding(String),

    #[error("No service register driver named '{0}'")]
    UnknownDriver(String),

    #[error("Service register driver '{0}' is already registered")]
    DuplicateDriver(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Topology parse error: {0}")]
    TopologyParse(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Machine group '{group}' has {running} running machines, {required} required")]
    CapacityShortfall {
        group: String,
        running: usize,
        required: usize,
    },

    #[error("Machine error: {0}")]
    Machine(String),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Service discovery error: {0}")]
    Discovery(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("{operation} failed: {}", errors.join("; "))]
    Batch {
        operation: String,
        errors: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl ArmadaError {
    /// Static misconfiguration that no retry can fix
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ArmadaError::DependencyCycle(_)
                | ArmadaError::MissingDependency { .. }
                | ArmadaError::InvalidPortBinding(_)
                | ArmadaError::UnknownDriver(_)
                | ArmadaError::DuplicateDriver(_)
                | ArmadaError::InvalidConfig(_)
                | ArmadaError::TopologyParse(_)
                | ArmadaError::GroupNotFound(_)
                | ArmadaError::Yaml(_)
        )
    }

    /// Capacity fell short of a group minimum
    pub fn is_shortfall(&self) -> bool {
        matches!(self, ArmadaError::CapacityShortfall { .. })
    }

    /// Combine the failures of a parallel batch into one error.
    ///
    /// Returns `Ok(())` when the batch had no failures and hands back a
    /// lone failure untouched so callers can still classify it.
    pub fn collect(operation: &str, mut errors: Vec<ArmadaError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ArmadaError::Batch {
                operation: operation.to_string(),
                errors: errors.iter().map(|e| e.to_string()).collect(),
            }),
        }
    }
}
