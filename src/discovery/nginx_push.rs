//! Upstream updates pushed to nginx control endpoints

use super::{check_response, DriverContext, ServiceRegisterDriver};
use crate::error::{ArmadaError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;

/// Driver name
pub const DRIVER_NAME: &str = "nginx-push";

/// Control endpoint path on every nginx
const CONTROL_PATH: &str = "upstream_add_server";

#[derive(Debug, Serialize, PartialEq, Eq)]
struct UpstreamChange {
    upstream: String,
    server: Vec<String>,
    method: &'static str,
}

/// Pushes upstream server changes to every known nginx
pub struct NginxPushDriver {
    upstream: String,
    urls: RwLock<Vec<String>>,
    client: Client,
}

impl NginxPushDriver {
    /// Build from a backend declaration; requires `upstream`
    pub fn from_context(ctx: &DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> {
        Ok(Arc::new(Self {
            upstream: ctx.required("upstream")?,
            urls: RwLock::new(Vec::new()),
            client: ctx.client.clone(),
        }))
    }

    fn urls(&self) -> Result<Vec<String>> {
        self.urls
            .read()
            .map(|u| u.clone())
            .map_err(|_| ArmadaError::Lock("Failed to acquire read lock".to_string()))
    }

    async fn push(&self, host: &str, port: u16, method: &'static str) -> Result<()> {
        let urls = self.urls()?;
        if urls.is_empty() {
            tracing::warn!("No nginx known for upstream {}, skipping {} of {}:{}", self.upstream, method, host, port);
            return Ok(());
        }

        let change = UpstreamChange {
            upstream: self.upstream.clone(),
            server: vec![format!("{}:{}", host, port)],
            method,
        };
        let body = serde_json::to_string(&change)?;

        let mut set = JoinSet::new();
        for url in urls {
            let client = self.client.clone();
            let body = body.clone();
            set.spawn(async move {
                let endpoint = format!("http://{}/{}", url, CONTROL_PATH);
                let result = match client.post(&endpoint).body(body).send().await {
                    Ok(response) => check_response(&endpoint, response).await,
                    Err(e) => Err(ArmadaError::Network(e.to_string())),
                };
                (url, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((url, Ok(()))) => tracing::debug!("nginx {} accepted {} of {}:{}", url, method, host, port),
                Ok((url, Err(e))) => {
                    tracing::warn!("nginx {} rejected {} of {}:{}: {}", url, method, host, port, e);
                    errors.push(e);
                }
                Err(e) => errors.push(ArmadaError::Discovery(e.to_string())),
            }
        }
        ArmadaError::collect(&format!("nginx {}", method), errors)
    }
}

#[async_trait]
impl ServiceRegisterDriver for NginxPushDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn registry(&self, urls: Vec<String>) -> Result<()> {
        tracing::info!("nginx upstream {} now pushed to {:?}", self.upstream, urls);
        let mut current = self
            .urls
            .write()
            .map_err(|_| ArmadaError::Lock("Failed to acquire write lock".to_string()))?;
        *current = urls;
        Ok(())
    }

    async fn register(&self, host: &str, port: u16) -> Result<()> {
        self.push(host, port, "add").await
    }

    async fn unregister(&self, host: &str, port: u16) -> Result<()> {
        self.push(host, port, "del").await
    }
}
