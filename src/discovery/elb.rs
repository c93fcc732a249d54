//! Cloud load balancer registration through the `aws` CLI
//!
//! Endpoints are registered per instance, not per port: the container host's
//! public IP is mapped back to an EC2 instance id by scanning the
//! docker-machine store for an `amazonec2` machine with that address.

use super::{DriverContext, ServiceRegisterDriver};
use crate::command;
use crate::error::{ArmadaError, Result};
use crate::machine::DockerMachine;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Driver name
pub const DRIVER_NAME: &str = "elb";

/// docker-machine driver whose machines carry an instance id
pub const EC2_DRIVER: &str = "amazonec2";

/// Default CLI binary
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Load balancer settings from a backend declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElbSettings {
    pub name: String,
    pub region: String,
    pub protocol: String,
    pub port: u16,
}

impl ElbSettings {
    /// Read `service`, `region`, `protocol` and `port`
    pub fn from_context(ctx: &DriverContext) -> Result<Self> {
        let protocol = ctx
            .required("protocol")
            .or_else(|_| ctx.required("protocal"))?;
        let port = ctx.required("port")?;
        let port = port.parse::<u16>().map_err(|_| {
            ArmadaError::InvalidConfig(format!("Driver 'elb' option 'port' must be a port number, got '{}'", port))
        })?;

        Ok(Self {
            name: ctx.required("service")?,
            region: ctx.required("region")?,
            protocol,
            port,
        })
    }

    pub fn describe_args(&self) -> Vec<String> {
        command::args([
            "elb",
            "describe-load-balancers",
            "--region",
            self.region.as_str(),
            "--load-balancer-names",
            self.name.as_str(),
        ])
    }

    pub fn create_args(&self) -> Vec<String> {
        let listener = format!(
            "Protocol={},LoadBalancerPort={},InstanceProtocol={},InstancePort={}",
            self.protocol, self.port, self.protocol, self.port
        );
        command::args([
            "elb".to_string(),
            "create-load-balancer".to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--load-balancer-name".to_string(),
            self.name.clone(),
            "--listeners".to_string(),
            listener,
            "--availability-zones".to_string(),
            format!("{}a", self.region),
            format!("{}b", self.region),
        ])
    }

    pub fn register_args(&self, instance_id: &str) -> Vec<String> {
        self.instance_args("register-instances-with-load-balancer", instance_id)
    }

    pub fn deregister_args(&self, instance_id: &str) -> Vec<String> {
        self.instance_args("deregister-instances-from-load-balancer", instance_id)
    }

    fn instance_args(&self, action: &str, instance_id: &str) -> Vec<String> {
        command::args([
            "elb",
            action,
            "--region",
            self.region.as_str(),
            "--load-balancer-name",
            self.name.as_str(),
            "--instances",
            instance_id,
        ])
    }
}

/// EC2 instance behind a docker-machine host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ec2Instance {
    pub instance_id: String,
    pub private_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineConfig {
    #[serde(default)]
    driver_name: String,
    #[serde(default)]
    driver: Ec2DriverConfig,
}

#[derive(Debug, Default, Deserialize)]
struct Ec2DriverConfig {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "InstanceId", default)]
    instance_id: String,
    #[serde(rename = "PrivateIPAddress", default)]
    private_ip_address: String,
}

/// Find the EC2 instance whose public IP is `ip` in a docker-machine store
pub async fn find_instance(store: &Path, ip: &str) -> Result<Ec2Instance> {
    let mut entries = match tokio::fs::read_dir(store).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArmadaError::MachineNotFound(format!("no {} machine with IP {}", EC2_DRIVER, ip)));
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type().await?.is_dir() {
            continue;
        }

        let content = match tokio::fs::read_to_string(entry.path().join("config.json")).await {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("Skipping machine {}: {}", name, e);
                continue;
            }
        };
        let config: MachineConfig = match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Unreadable config for machine {}: {}", name, e);
                continue;
            }
        };

        if config.driver_name == EC2_DRIVER && config.driver.ip_address == ip {
            return Ok(Ec2Instance {
                instance_id: config.driver.instance_id,
                private_ip: config.driver.private_ip_address,
            });
        }
    }

    Err(ArmadaError::MachineNotFound(format!("no {} machine with IP {}", EC2_DRIVER, ip)))
}

/// Registers EC2 instances with a classic load balancer
pub struct ElbDriver {
    settings: ElbSettings,
    aws: Vec<String>,
    store: Option<PathBuf>,
    ensured: OnceCell<()>,
}

impl ElbDriver {
    /// Build from a backend declaration
    pub fn from_context(ctx: &DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> {
        let settings = ElbSettings::from_context(ctx)?;
        Ok(Arc::new(Self::new(
            settings,
            vec![DEFAULT_AWS_BIN.to_string()],
            DockerMachine::store_dir(),
        )))
    }

    /// Driver invoking the command line `aws` (program plus leading args)
    pub fn new(settings: ElbSettings, aws: Vec<String>, store: Option<PathBuf>) -> Self {
        Self {
            settings,
            aws,
            store,
            ensured: OnceCell::new(),
        }
    }

    async fn aws(&self, args: Vec<String>) -> Result<String> {
        let (program, leading) = self
            .aws
            .split_first()
            .ok_or_else(|| ArmadaError::InvalidConfig("empty aws command".to_string()))?;
        let mut argv = leading.to_vec();
        argv.extend(args);
        command::run(program, &argv).await
    }

    async fn ensure_load_balancer(&self) -> Result<()> {
        self.ensured
            .get_or_try_init(|| async {
                if self.aws(self.settings.describe_args()).await.is_ok() {
                    return Ok(());
                }
                tracing::info!(
                    "Creating load balancer {} in {}",
                    self.settings.name,
                    self.settings.region
                );
                self.aws(self.settings.create_args()).await.map(|_| ())
            })
            .await
            .map(|_| ())
    }

    async fn instance(&self, host: &str) -> Result<Ec2Instance> {
        let store = self
            .store
            .as_deref()
            .ok_or_else(|| ArmadaError::Discovery("docker-machine store not found".to_string()))?;
        find_instance(store, host).await
    }
}

#[async_trait]
impl ServiceRegisterDriver for ElbDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn registry(&self, _urls: Vec<String>) -> Result<()> {
        Ok(())
    }

    async fn register(&self, host: &str, port: u16) -> Result<()> {
        self.ensure_load_balancer().await?;
        let instance = self.instance(host).await?;
        tracing::info!(
            "Registering {} ({}:{}, private {}) with {}",
            instance.instance_id,
            host,
            port,
            instance.private_ip,
            self.settings.name
        );
        self.aws(self.settings.register_args(&instance.instance_id)).await?;
        Ok(())
    }

    async fn unregister(&self, host: &str, port: u16) -> Result<()> {
        let instance = self.instance(host).await?;
        tracing::info!(
            "Deregistering {} ({}:{}) from {}",
            instance.instance_id,
            host,
            port,
            self.settings.name
        );
        self.aws(self.settings.deregister_args(&instance.instance_id)).await?;
        Ok(())
    }
}
