//! Outbound gateway to node daemons.
//!
//! The control plane never talks to a workload directly; every install,
//! transfer push, deletion, reinstall and resync goes through the daemon
//! running on the workload's node. The gateway is a trait so the HTTP
//! implementation can be swapped for a fake in tests.

mod http;

pub use http::HttpDaemonGateway;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::db::NodeRecord;

/// Errors from daemon calls. `Connect` covers anything where no HTTP status
/// came back; `Status` is the daemon refusing the request.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon on node {node_id} unreachable: {source}")]
    Connect {
        node_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("daemon on node {node_id} returned {status}: {body}")]
    Status {
        node_id: String,
        status: u16,
        body: String,
    },
}

/// Routing and auth material for one node's daemon, derived from its row.
#[derive(Debug, Clone)]
pub struct NodeRoute {
    pub node_id: String,
    pub base_url: String,
    /// Full bearer credential, `<token_id>.<token>`.
    pub bearer: String,
}

impl NodeRoute {
    pub fn from_node(node: &NodeRecord) -> Self {
        Self {
            node_id: node.node_id.clone(),
            base_url: format!("{}://{}:{}", node.scheme, node.fqdn, node.daemon_port),
            bearer: format!("{}.{}", node.daemon_token_id, node.daemon_token),
        }
    }
}

/// One network binding handed to the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_alias: Option<String>,
}

/// Everything a daemon needs to create and install a workload.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSpec {
    pub uuid: Uuid,
    pub name: String,
    pub image_ref: String,
    pub start_on_completion: bool,
    pub primary: PortBinding,
    pub additional: Vec<PortBinding>,
}

/// Instruction for a source daemon to push a workload to its destination.
#[derive(Debug, Clone, Serialize)]
pub struct TransferTicket {
    /// Base URL of the destination daemon.
    pub destination_url: String,
    /// Bearer credential the source presents to the destination.
    pub destination_bearer: String,
    pub primary: PortBinding,
    pub additional: Vec<PortBinding>,
}

/// Daemon-facing operations. Workloads are addressed by uuid only; internal
/// row ids never cross this boundary.
#[async_trait]
pub trait DaemonGateway: Send + Sync {
    /// Create the workload on the node and start its install.
    async fn create_and_install(
        &self,
        route: &NodeRoute,
        spec: &WorkloadSpec,
    ) -> Result<(), DaemonError>;

    /// Tell the source daemon to push the workload to its destination.
    async fn push_transfer(
        &self,
        source: &NodeRoute,
        uuid: Uuid,
        ticket: &TransferTicket,
    ) -> Result<(), DaemonError>;

    /// Remove the workload from the node.
    async fn delete_workload(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError>;

    /// Wipe and reinstall the workload in place.
    async fn reinstall_workload(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError>;

    /// Ask the daemon to re-pull the workload's configuration.
    async fn resync(&self, route: &NodeRoute, uuid: Uuid) -> Result<(), DaemonError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node() -> NodeRecord {
        NodeRecord {
            node_id: "node_01ABC".into(),
            name: "n1".into(),
            fqdn: "n1.gantry.test".into(),
            scheme: "https".into(),
            daemon_port: 8080,
            daemon_token_id: "tkid123".into(),
            daemon_token: "secret456".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_route_from_node() {
        let route = NodeRoute::from_node(&node());
        assert_eq!(route.base_url, "https://n1.gantry.test:8080");
        assert_eq!(route.bearer, "tkid123.secret456");
    }

    #[test]
    fn test_workload_spec_serialization_omits_empty_alias() {
        let spec = WorkloadSpec {
            uuid: Uuid::nil(),
            name: "mc-lobby".into(),
            image_ref: "ghcr.io/gantry/minecraft:latest".into(),
            start_on_completion: true,
            primary: PortBinding {
                ip: "10.0.0.5".into(),
                port: 25565,
                ip_alias: None,
            },
            additional: vec![],
        };

        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"port\":25565"));
        assert!(!json.contains("ip_alias"));
    }
}
