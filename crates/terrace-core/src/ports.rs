//! Port reservations through the ingress port allocator.

use crate::error::{Result, TerraceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// A request to expose `target_service:target_port` on `source_port` of the
/// ingress that owns `allocator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub allocator: String,
    pub protocol: String,
    pub source_port: u16,
    pub target_service: String,
    pub target_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocatePortRequest<'a> {
    protocol: &'a str,
    source_port: u16,
    target_service: &'a str,
    target_port: u16,
}

#[async_trait]
pub trait PortAllocator: Send + Sync {
    async fn allocate(&self, port: &PortForward) -> Result<()>;
}

/// Posts each reservation as JSON to the allocator URL carried by the
/// request. Only `200 OK` counts as success.
#[derive(Debug, Clone)]
pub struct HttpPortAllocator {
    client: reqwest::Client,
}

impl HttpPortAllocator {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TerraceError::external("port-allocator", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PortAllocator for HttpPortAllocator {
    async fn allocate(&self, port: &PortForward) -> Result<()> {
        let body = AllocatePortRequest {
            protocol: &port.protocol,
            source_port: port.source_port,
            target_service: &port.target_service,
            target_port: port.target_port,
        };
        let resp = self
            .client
            .post(&port.allocator)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %port.allocator, "port allocation request failed");
                TerraceError::Allocation {
                    port: port.source_port,
                    reason: e.to_string(),
                }
            })?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(TerraceError::Allocation {
                port: port.source_port,
                reason: format!("status code: {}", resp.status().as_u16()),
            });
        }
        info!(
            port = port.source_port,
            service = %port.target_service,
            "allocated port"
        );
        Ok(())
    }
}

/// Allocates without contacting anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPortAllocator;

#[async_trait]
impl PortAllocator for NoopPortAllocator {
    async fn allocate(&self, port: &PortForward) -> Result<()> {
        info!(port = port.source_port, "skipping port allocation");
        Ok(())
    }
}

/// Request every port in order, stopping at the first failure.
pub async fn open_ports<A: PortAllocator + ?Sized>(allocator: &A, ports: &[PortForward]) -> Result<()> {
    for port in ports {
        allocator.allocate(port).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn forward(url: String, source_port: u16) -> PortForward {
        PortForward {
            allocator: url,
            protocol: "TCP".into(),
            source_port,
            target_service: "ns1/pihole-dns".into(),
            target_port: 53,
        }
    }

    #[tokio::test]
    async fn posts_request_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/allocate")
            .match_body(Matcher::Json(json!({
                "protocol": "TCP",
                "sourcePort": 53,
                "targetService": "ns1/pihole-dns",
                "targetPort": 53,
            })))
            .with_status(200)
            .create_async()
            .await;
        let alloc = HttpPortAllocator::new().unwrap();
        alloc
            .allocate(&forward(format!("{}/api/allocate", server.url()), 53))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_ok_status_is_allocation_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/allocate")
            .with_status(201)
            .create_async()
            .await;
        let alloc = HttpPortAllocator::new().unwrap();
        let err = alloc
            .allocate(&forward(format!("{}/api/allocate", server.url()), 8053))
            .await
            .unwrap_err();
        match err {
            TerraceError::Allocation { port, reason } => {
                assert_eq!(port, 8053);
                assert!(reason.contains("201"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn open_ports_stops_at_first_failure() {
        let mut server = mockito::Server::new_async().await;
        let _bad = server
            .mock("POST", "/bad")
            .with_status(500)
            .create_async()
            .await;
        let good = server
            .mock("POST", "/good")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;
        let alloc = HttpPortAllocator::new().unwrap();
        let ports = vec![
            forward(format!("{}/bad", server.url()), 1),
            forward(format!("{}/good", server.url()), 2),
        ];
        assert!(open_ports(&alloc, &ports).await.is_err());
        good.assert_async().await;
    }
}
