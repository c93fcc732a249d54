//! Service discovery backends
//!
//! A backend is declared by name in the topology and built through a
//! [`DriverRegistry`], which maps driver names to constructors. The registry
//! is an explicit value owned by the cluster context.

pub mod consul_catalog;
pub mod consul_kv;
pub mod elb;
pub mod nginx_push;

pub use consul_catalog::HaproxyConsulDriver;
pub use consul_kv::NginxConsulDriver;
pub use elb::ElbDriver;
pub use nginx_push::NginxPushDriver;

use crate::error::{ArmadaError, Result};
use crate::topology::config::SD_DRIVER_KEY;
use crate::topology::ServiceDiscoverDescription;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Connect timeout of backend HTTP calls
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Request timeout of backend HTTP calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Port of the consul HTTP API
pub const CONSUL_HTTP_PORT: u16 = 8500;

/// Registers and unregisters service endpoints with one backend
#[async_trait]
pub trait ServiceRegisterDriver: Send + Sync {
    /// Driver name
    fn name(&self) -> &str;

    /// Replace the set of backend instances the driver talks to
    async fn registry(&self, urls: Vec<String>) -> Result<()>;

    /// Add `host:port`
    async fn register(&self, host: &str, port: u16) -> Result<()>;

    /// Remove `host:port`
    async fn unregister(&self, host: &str, port: u16) -> Result<()>;
}

/// Everything a driver constructor may need
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// The backend's declaration
    pub description: ServiceDiscoverDescription,
    /// Consul server addresses
    pub consul_ips: Vec<String>,
    /// Shared HTTP client
    pub client: Client,
}

impl DriverContext {
    /// Value of a required description key
    pub fn required(&self, key: &str) -> Result<String> {
        match self.description.get(key) {
            Some(v) if !v.is_empty() => Ok(v.clone()),
            _ => Err(ArmadaError::InvalidConfig(format!(
                "Driver '{}' requires option '{}'",
                self.driver_name(),
                key
            ))),
        }
    }

    /// Driver name from the description
    pub fn driver_name(&self) -> &str {
        self.description.get(SD_DRIVER_KEY).map(String::as_str).unwrap_or_default()
    }

    /// `http://{ip}:8500` of the first consul server
    pub fn consul_address(&self) -> Result<String> {
        self.consul_ips
            .first()
            .map(|ip| format!("http://{}:{}", ip, CONSUL_HTTP_PORT))
            .ok_or_else(|| {
                ArmadaError::InvalidConfig(format!("Driver '{}' needs a consul server", self.driver_name()))
            })
    }
}

/// Builds a driver from its context
pub type DriverConstructor =
    Arc<dyn Fn(&DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> + Send + Sync>;

/// Driver constructors by name
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in drivers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&str, DriverConstructor); 4] = [
            (nginx_push::DRIVER_NAME, Arc::new(NginxPushDriver::from_context)),
            (consul_kv::DRIVER_NAME, Arc::new(NginxConsulDriver::from_context)),
            (consul_catalog::DRIVER_NAME, Arc::new(HaproxyConsulDriver::from_context)),
            (elb::DRIVER_NAME, Arc::new(ElbDriver::from_context)),
        ];
        for (name, constructor) in builtin {
            registry.constructors.insert(name.to_string(), constructor);
        }
        registry
    }

    /// Add a constructor; a name can only be registered once
    pub fn register(&mut self, name: &str, constructor: DriverConstructor) -> Result<()> {
        if self.constructors.contains_key(name) {
            return Err(ArmadaError::DuplicateDriver(name.to_string()));
        }
        self.constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    /// Whether a driver name is known
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Build the driver a description names
    pub fn build(&self, ctx: &DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> {
        let name = ctx.driver_name();
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ArmadaError::UnknownDriver(name.to_string()))?;
        constructor(ctx)
    }
}

/// HTTP client for discovery backends
pub fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ArmadaError::Network(e.to_string()))
}

/// Fail on a non-success status, keeping the response body
pub(crate) async fn check_response(what: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ArmadaError::Discovery(format!("{} returned {}: {}", what, status, body.trim())))
}
