//! HTTP implementation of the daemon gateway.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use super::{DaemonError, DaemonGateway, NodeRoute, TransferTicket, WorkloadSpec};

/// Talks to node daemons over their HTTP API.
pub struct HttpDaemonGateway {
    client: reqwest::Client,
}

impl HttpDaemonGateway {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self { client }
    }

    async fn check(
        route: &NodeRoute,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<(), DaemonError> {
        let response = response.map_err(|source| DaemonError::Connect {
            node_id: route.node_id.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(node_id = %route.node_id, status = %status, body = %body, "Daemon call failed");
            return Err(DaemonError::Status {
                node_id: route.node_id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl DaemonGateway for HttpDaemonGateway {
    async fn create_and_install(
        &self,
        route: &NodeRoute,
        spec: &WorkloadSpec,
    ) -> Result<(), DaemonError> {
        let url = format!("{}/api/workloads", route.base_url);
        debug!(node_id = %route.node_id, uuid = %spec.uuid, "Creating workload on daemon");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&route.bearer)
            .json(spec)
            .send()
            .await;

        Self::check(route, response).await
    }

    async fn push_transfer(
        &self,
        source: &NodeRoute,
        uuid: Uuid,
        ticket: &TransferTicket,
    ) -> Result<(), DaemonError> {
        let url = format!("{}/api/workloads/{}/transfer", source.base_url, uuid);
        debug!(node_id = %source.node_id, uuid = %uuid, "Requesting transfer push from daemon");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&source.bearer)
            .json(ticket)
            .send()
            .await;

        Self::check(source, response).await
    }

    async fn delete_workload(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError> {
        let url = format!("{}/api/workloads/{}", route.base_url, uuid);
        debug!(node_id = %route.node_id, uuid = %uuid, "Deleting workload on daemon");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&route.bearer)
            .send()
            .await;

        Self::check(route, response).await
    }

    async fn reinstall_workload(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError> {
        let url = format!("{}/api/workloads/{}/reinstall", route.base_url, uuid);
        debug!(node_id = %route.node_id, uuid = %uuid, "Reinstalling workload on daemon");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&route.bearer)
            .send()
            .await;

        Self::check(route, response).await
    }

    async fn resync(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError> {
        let url = format!("{}/api/workloads/{}/sync", route.base_url, uuid);
        debug!(node_id = %route.node_id, uuid = %uuid, "Resyncing workload on daemon");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&route.bearer)
            .send()
            .await;

        Self::check(route, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::PortBinding;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route_to(server: &MockServer) -> NodeRoute {
        NodeRoute {
            node_id: "node_01TEST".into(),
            base_url: server.uri(),
            bearer: "tkid.secret".into(),
        }
    }

    fn spec(uuid: Uuid) -> WorkloadSpec {
        WorkloadSpec {
            uuid,
            name: "mc-lobby".into(),
            image_ref: "ghcr.io/gantry/minecraft:latest".into(),
            start_on_completion: true,
            primary: PortBinding {
                ip: "10.0.0.5".into(),
                port: 25565,
                ip_alias: None,
            },
            additional: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_and_install_posts_spec_with_bearer() {
        let server = MockServer::start().await;
        let uuid = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/api/workloads"))
            .and(header("authorization", "Bearer tkid.secret"))
            .and(body_partial_json(serde_json::json!({
                "uuid": uuid,
                "image_ref": "ghcr.io/gantry/minecraft:latest",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpDaemonGateway::new(Duration::from_secs(5));
        gateway
            .create_and_install(&route_to(&server), &spec(uuid))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_daemon_error_status_carries_body() {
        let server = MockServer::start().await;
        let uuid = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/api/workloads"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;

        let gateway = HttpDaemonGateway::new(Duration::from_secs(5));
        let err = gateway
            .create_and_install(&route_to(&server), &spec(uuid))
            .await
            .unwrap_err();

        match err {
            DaemonError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "disk full");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_transfer_targets_source_daemon() {
        let server = MockServer::start().await;
        let uuid = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path(format!("/api/workloads/{uuid}/transfer")))
            .and(body_partial_json(serde_json::json!({
                "destination_url": "https://dest.gantry.test:8080",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let ticket = TransferTicket {
            destination_url: "https://dest.gantry.test:8080".into(),
            destination_bearer: "tk2.secret2".into(),
            primary: PortBinding {
                ip: "10.0.1.9".into(),
                port: 25565,
                ip_alias: None,
            },
            additional: vec![],
        };

        let gateway = HttpDaemonGateway::new(Duration::from_secs(5));
        gateway
            .push_transfer(&route_to(&server), uuid, &ticket)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_workload_unreachable_is_connect_error() {
        // Port 9 on localhost is reliably closed.
        let route = NodeRoute {
            node_id: "node_01TEST".into(),
            base_url: "http://127.0.0.1:9".into(),
            bearer: "tkid.secret".into(),
        };

        let gateway = HttpDaemonGateway::new(Duration::from_secs(1));
        let err = gateway
            .delete_workload(&route, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, DaemonError::Connect { .. }));
    }
}
