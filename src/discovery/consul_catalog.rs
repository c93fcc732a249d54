//! haproxy backends kept in the consul service catalog

use super::{check_response, DriverContext, ServiceRegisterDriver};
use crate::error::{ArmadaError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

/// Driver name
pub const DRIVER_NAME: &str = "haproxy-consul";

/// Datacenter every node is registered in
pub const DATACENTER: &str = "dc1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogRegistration {
    datacenter: &'static str,
    node: String,
    address: String,
    service: CatalogService,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogDeregistration {
    datacenter: &'static str,
    node: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
}

/// Registers one catalog node per endpoint, `{service}-{host}-{port}`
pub struct HaproxyConsulDriver {
    service: String,
    consul: String,
    client: Client,
}

impl HaproxyConsulDriver {
    /// Build from a backend declaration; requires `service` and a consul server
    pub fn from_context(ctx: &DriverContext) -> Result<Arc<dyn ServiceRegisterDriver>> {
        Ok(Arc::new(Self {
            service: ctx.required("service")?,
            consul: ctx.consul_address()?,
            client: ctx.client.clone(),
        }))
    }

    /// Catalog node name of an endpoint
    pub fn node_name(&self, host: &str, port: u16) -> String {
        format!("{}-{}-{}", self.service, host, port)
    }

    async fn put<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.consul, path);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ArmadaError::Network(e.to_string()))?;
        check_response(&url, response).await
    }
}

#[async_trait]
impl ServiceRegisterDriver for HaproxyConsulDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn registry(&self, _urls: Vec<String>) -> Result<()> {
        Ok(())
    }

    async fn register(&self, host: &str, port: u16) -> Result<()> {
        let node = self.node_name(host, port);
        tracing::debug!("Registering catalog node {}", node);
        let registration = CatalogRegistration {
            datacenter: DATACENTER,
            node: node.clone(),
            address: host.to_string(),
            service: CatalogService {
                id: node,
                service: self.service.clone(),
                address: host.to_string(),
                port,
            },
        };
        self.put("/v1/catalog/register", &registration).await
    }

    async fn unregister(&self, host: &str, port: u16) -> Result<()> {
        let node = self.node_name(host, port);
        tracing::debug!("Deregistering catalog node {}", node);
        let deregistration = CatalogDeregistration {
            datacenter: DATACENTER,
            node,
            service_id: self.service.clone(),
        };
        self.put("/v1/catalog/deregister", &deregistration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::http_client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_catalog_register_and_deregister() {
        let consul = MockServer::start().await;
        for endpoint in ["/v1/catalog/register", "/v1/catalog/deregister"] {
            Mock::given(method("PUT"))
                .and(path(endpoint))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&consul)
                .await;
        }
        let driver = HaproxyConsulDriver {
            service: "api".to_string(),
            consul: consul.uri(),
            client: http_client().unwrap(),
        };

        driver.register("10.0.0.4", 8080).await.unwrap();
        driver.unregister("10.0.0.4", 8080).await.unwrap();

        let requests = consul.received_requests().await.unwrap();
        assert_eq!(requests[0].url.path(), "/v1/catalog/register");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["Datacenter"], "dc1");
        assert_eq!(body["Node"], "api-10.0.0.4-8080");
        assert_eq!(body["Service"]["Port"], 8080);
        assert_eq!(body["Service"]["ID"], "api-10.0.0.4-8080");

        assert_eq!(requests[1].url.path(), "/v1/catalog/deregister");
        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(body["Node"], "api-10.0.0.4-8080");
        assert_eq!(body["ServiceID"], "api");
    }
}
