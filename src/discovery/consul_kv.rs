//! nginx upstreams kept in the consul key/value store

use super::{check_response, DriverContext, ServiceRegisterDriver};
use crate::error::{ArmadaError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

/// Driver name
pub const DRIVER_NAME: &str = "nginx-consul";

/// Key prefix read by the nginx consul template
pub const KEY_PREFIX: &str = "upstream";

/// Writes one key per server under `upstream/{upstream}/`
pub struct NginxConsulDriver {
    upstream: String,
    consul: String,
    client: Client,
}

impl NginxConsulDriver {
    /// Build from a backend declaration; requires `upstream` and a consul server
    pub fn from_context(ctx: &DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> {
        Ok(Arc::new(Self {
            upstream: ctx.required("upstream")?,
            consul: ctx.consul_address()?,
            client: ctx.client.clone(),
        }))
    }

    /// KV key of one server
    pub fn key(&self, host: &str, port: u16) -> String {
        format!("{}/{}/{}:{}", KEY_PREFIX, self.upstream, host, port)
    }

    fn url(&self, host: &str, port: u16) -> String {
        format!("{}/v1/kv/{}", self.consul, self.key(host, port))
    }
}

#[async_trait]
impl ServiceRegisterDriver for NginxConsulDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn registry(&self, urls: Vec<String>) -> Result<()> {
        tracing::debug!("nginx-consul ignores instance list {:?}, using {}", urls, self.consul);
        Ok(())
    }

    async fn register(&self, host: &str, port: u16) -> Result<()> {
        let url = self.url(host, port);
        tracing::debug!("Putting {}", url);
        let response = self
            .client
            .put(&url)
            .body(format!("{}:{}", host, port))
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;
        check_response(&url, response).await
    }

    async fn unregister(&self, host: &str, port: u16) -> Result<()> {
        let url = self.url(host, port);
        tracing::debug!("Deleting {}", url);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;
        check_response(&url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::http_client;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_register_writes_kv() {
        let consul = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/upstream/api/10.0.0.3:9000"))
            .and(body_string("10.0.0.3:9000"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&consul)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/kv/upstream/api/10.0.0.3:9000"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&consul)
            .await;

        let driver = NginxConsulDriver {
            upstream: "api".to_string(),
            consul: consul.uri(),
            client: http_client().unwrap(),
        };

        driver.register("10.0.0.3", 9000).await.unwrap();
        driver.unregister("10.0.0.3", 9000).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_write_is_reported() {
        let consul = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("no leader"))
            .mount(&consul)
            .await;

        let driver = NginxConsulDriver {
            upstream: "api".to_string(),
            consul: consul.uri(),
            client: http_client().unwrap(),
        };
        match driver.register("10.0.0.3", 9000).await.unwrap_err() {
            ArmadaError::Discovery(message) => assert!(message.contains("no leader")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_requires_consul() {
        let ctx = DriverContext {
            description: HashMap::from([("upstream".to_string(), "api".to_string())]),
            consul_ips: Vec::new(),
            client: http_client().unwrap(),
        };
        assert!(NginxConsulDriver::from_context(&ctx).is_err());
    }
}
