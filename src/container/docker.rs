//! Docker Engine API runtime

use super::config::{ContainerInfo, ListFilter, PublishedPort, RunConfig};
use super::{ContainerRuntime, RuntimeConnector};
use crate::error::{ArmadaError, Result};
use crate::machine::MachineProvisioner;
use crate::naming::split_node;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Certificate, Client, Identity, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Connect timeout of engine requests
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout of engine requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds the engine waits for a container to stop before killing it
pub const STOP_GRACE_SECS: u64 = 10;

/// Image prefix of the swarm agent containers, which are never managed
const SWARM_IMAGE_PREFIX: &str = "swarm:";

/// Where and how to reach an engine, as printed by `docker-machine config`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineEndpoint {
    /// `tcp://host:port`
    pub host: String,
    pub tls_verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl EngineEndpoint {
    /// Parse a `--tlsverify --tlscacert=... --tlscert=... --tlskey=... -H=...` line
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut endpoint = EngineEndpoint::default();

        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            let (flag, inline) = match token.split_once('=') {
                Some((f, v)) => (f, Some(v)),
                None => (token, None),
            };

            if flag == "--tlsverify" {
                endpoint.tls_verify = inline.map_or(true, |v| v != "false");
                i += 1;
                continue;
            }

            let value = match inline {
                Some(v) => v.to_string(),
                None => {
                    i += 1;
                    tokens.get(i).map(|v| v.to_string()).unwrap_or_default()
                }
            };
            let value = value.trim_matches('"').to_string();

            match flag {
                "--tlscacert" => endpoint.ca_cert = Some(PathBuf::from(value)),
                "--tlscert" => endpoint.cert = Some(PathBuf::from(value)),
                "--tlskey" => endpoint.key = Some(PathBuf::from(value)),
                "-H" | "--host" => endpoint.host = value,
                other => tracing::debug!("Ignoring engine flag {}", other),
            }
            i += 1;
        }

        if endpoint.host.is_empty() {
            return Err(ArmadaError::InvalidConfig(format!("No engine host in '{}'", line)));
        }
        Ok(endpoint)
    }

    /// Base URL for REST calls
    pub fn base_url(&self) -> String {
        let address = self
            .host
            .strip_prefix("tcp://")
            .unwrap_or(&self.host)
            .trim_end_matches('/');
        if self.tls_verify || self.cert.is_some() {
            format!("https://{}", address)
        } else {
            format!("http://{}", address)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPort {
    #[serde(rename = "IP", default)]
    ip: String,
    #[serde(default)]
    private_port: u16,
    #[serde(default)]
    public_port: u16,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ports: Vec<ApiPort>,
    #[serde(default)]
    created: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiHostPort {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiRestartPolicy {
    name: String,
    maximum_retry_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiHostConfig {
    port_bindings: HashMap<String, Vec<ApiHostPort>>,
    binds: Vec<String>,
    dns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_policy: Option<ApiRestartPolicy>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiCreate {
    image: String,
    env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    exposed_ports: HashMap<String, HashMap<String, String>>,
    host_config: ApiHostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiCreated {
    id: String,
}

fn create_body(config: &RunConfig) -> ApiCreate {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for pb in &config.port_bindings {
        let key = format!("{}/{}", pb.container_port, pb.protocol);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(Vec::new)
            .push(ApiHostPort {
                host_ip: "0.0.0.0".to_string(),
                host_port: pb.host_port.to_string(),
            });
    }

    ApiCreate {
        image: config.image.clone(),
        env: config.env.clone(),
        cmd: config.cmd.clone(),
        hostname: config.hostname.clone(),
        exposed_ports,
        host_config: ApiHostConfig {
            port_bindings,
            binds: config.binds.clone(),
            dns: config.dns.clone(),
            restart_policy: config.restart_policy.as_ref().map(|p| ApiRestartPolicy {
                name: p.name.clone(),
                maximum_retry_count: p.max_retry,
            }),
        },
    }
}

fn to_info(api: ApiContainer) -> Option<ContainerInfo> {
    if api.image.starts_with(SWARM_IMAGE_PREFIX) {
        return None;
    }
    let full = api.names.first()?;
    let (node, name) = split_node(full);

    Some(ContainerInfo {
        id: api.id,
        name: name.to_string(),
        node: node.map(str::to_string),
        image: api.image,
        status: api.status,
        ports: api
            .ports
            .into_iter()
            .filter(|p| p.public_port > 0)
            .map(|p| PublishedPort {
                ip: p.ip,
                public_port: p.public_port,
                private_port: p.private_port,
                protocol: if p.kind.is_empty() { "tcp".to_string() } else { p.kind },
            })
            .collect(),
        created: Utc
            .timestamp_opt(api.created, 0)
            .single()
            .unwrap_or_default(),
    })
}

/// Parse a `/containers/json` response
pub fn parse_container_list(body: &str) -> Result<Vec<ContainerInfo>> {
    let containers: Vec<ApiContainer> = serde_json::from_str(body)?;
    Ok(containers.into_iter().filter_map(to_info).collect())
}

/// Split `repo[:tag]` into its repository and tag, `latest` by default
pub fn split_image(image: &str) -> (&str, &str) {
    let slash = image.rfind('/').map_or(0, |i| i + 1);
    match image[slash..].rfind(':') {
        Some(i) => (&image[..slash + i], &image[slash + i + 1..]),
        None => (image, "latest"),
    }
}

/// Container runtime speaking the Docker Engine REST API
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: Client,
    base_url: String,
}

impl DockerEngine {
    /// Build a client for an endpoint, loading its TLS material
    pub fn connect(endpoint: &EngineEndpoint) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();

        if let Some(ca) = &endpoint.ca_cert {
            let pem = std::fs::read(ca)?;
            let cert = Certificate::from_pem(&pem).map_err(|e| ArmadaError::Network(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&endpoint.cert, &endpoint.key) {
            let mut pem = std::fs::read(cert)?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key)?);
            let identity = Identity::from_pem(&pem).map_err(|e| ArmadaError::Network(e.to_string()))?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| ArmadaError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: endpoint.base_url(),
        })
    }

    async fn send(&self, method: Method, path: &str, timeout: Option<Duration>) -> Result<Response> {
        let mut request = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        request.send().await.map_err(|e| ArmadaError::Network(e.to_string()))
    }

    async fn expect_ok(&self, id: &str, action: &str, response: Response) -> Result<()> {
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(ArmadaError::ContainerNotFound(id.to_string())),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ArmadaError::Container(format!(
                    "Failed to {} {}: {} {}",
                    action,
                    id,
                    s,
                    body.trim()
                )))
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let (repo, tag) = split_image(image);
        tracing::info!("Pulling image {}:{}", repo, tag);

        let response = self
            .client
            .post(format!("{}/images/create", self.base_url))
            .query(&[("fromImage", repo), ("tag", tag)])
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArmadaError::Container(format!(
                "Failed to pull {}: {} {}",
                image,
                status,
                body.trim()
            )));
        }
        // The pull finishes when the progress stream ends.
        response.text().await.map_err(|e| ArmadaError::Network(e.to_string()))?;
        Ok(())
    }

    async fn try_create(&self, config: &RunConfig) -> Result<std::result::Result<String, StatusCode>> {
        let response = self
            .client
            .post(format!("{}/containers/create", self.base_url))
            .query(&[("name", config.name.as_str())])
            .json(&create_body(config))
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let created: ApiCreated = response.json().await.map_err(|e| ArmadaError::Network(e.to_string()))?;
            return Ok(Ok(created.id));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(Err(status));
        }
        let body = response.text().await.unwrap_or_default();
        Err(ArmadaError::Container(format!(
            "Failed to create {}: {} {}",
            config.name,
            status,
            body.trim()
        )))
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerInfo>> {
        let response = self
            .client
            .get(format!("{}/containers/json", self.base_url))
            .query(&[("all", "1")])
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ArmadaError::Container(format!(
                "Failed to list containers: {}",
                response.status()
            )));
        }
        let body = response.text().await.map_err(|e| ArmadaError::Network(e.to_string()))?;
        let containers = parse_container_list(&body)?;

        filter.apply(containers)
    }

    async fn create(&self, config: &RunConfig) -> Result<String> {
        match self.try_create(config).await? {
            Ok(id) => Ok(id),
            Err(_) => {
                self.pull(&config.image).await?;
                self.try_create(config).await?.map_err(|status| {
                    ArmadaError::Container(format!(
                        "Failed to create {} after pulling {}: {}",
                        config.name, config.image, status
                    ))
                })
            }
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        let response = self.send(Method::POST, &format!("/containers/{}/start", id), None).await?;
        self.expect_ok(id, "start", response).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                &format!("/containers/{}/stop?t={}", id, STOP_GRACE_SECS),
                Some(REQUEST_TIMEOUT + Duration::from_secs(STOP_GRACE_SECS)),
            )
            .await?;
        self.expect_ok(id, "stop", response).await
    }

    async fn restart(&self, id: &str) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                &format!("/containers/{}/restart?t={}", id, STOP_GRACE_SECS),
                Some(REQUEST_TIMEOUT + Duration::from_secs(STOP_GRACE_SECS)),
            )
            .await?;
        self.expect_ok(id, "restart", response).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let response = self
            .send(Method::DELETE, &format!("/containers/{}?force=1&v=1", id), None)
            .await?;
        self.expect_ok(id, "remove", response).await
    }
}

/// Opens [`DockerEngine`]s using the provisioner's engine configuration
pub struct EngineConnector {
    provisioner: Arc<dyn MachineProvisioner>,
}

impl EngineConnector {
    /// Create a connector
    pub fn new(provisioner: Arc<dyn MachineProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl RuntimeConnector for EngineConnector {
    async fn connect(&self, machine: &str, swarm: bool) -> Result<Arc<dyn ContainerRuntime>> {
        let line = self.provisioner.engine_config(machine, swarm).await?;
        let endpoint = EngineEndpoint::parse(&line)?;
        tracing::debug!("Connecting to engine of {} at {}", machine, endpoint.host);
        Ok(Arc::new(DockerEngine::connect(&endpoint)?))
    }
}
