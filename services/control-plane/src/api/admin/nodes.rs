//! Node and allocation pool admin endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use gantry_id::NodeId;
use gantry_networking::{parse_address_spec, parse_port_spec};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::{ListedAllocation, NodeRecord};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_node).get(list_nodes))
        .route("/{node_id}", get(get_node))
        .route(
            "/{node_id}/allocations",
            get(list_allocations).post(create_allocations),
        )
        .route(
            "/{node_id}/allocations/{allocation_id}",
            delete(delete_allocation),
        )
        .route(
            "/{node_id}/allocations/{allocation_id}/release",
            post(release_allocation),
        )
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,

    /// Hostname the daemon is reachable on.
    pub fqdn: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_daemon_port")]
    pub daemon_port: i32,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_daemon_port() -> i32 {
    8080
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub fqdn: String,
    pub scheme: String,
    pub daemon_port: i32,
    pub daemon_token_id: String,
    pub created_at: String,
}

/// Returned only from node creation: the one time the daemon token is shown.
#[derive(Debug, Serialize)]
pub struct CreatedNodeResponse {
    #[serde(flatten)]
    pub node: NodeResponse,
    pub daemon_token: String,
}

impl NodeResponse {
    fn from_record(node: &NodeRecord) -> Self {
        Self {
            id: node.node_id.clone(),
            name: node.name.clone(),
            fqdn: node.fqdn.clone(),
            scheme: node.scheme.clone(),
            daemon_port: node.daemon_port,
            daemon_token_id: node.daemon_token_id.clone(),
            created_at: node.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAllocationsRequest {
    /// One address/CIDR spec, or several of them.
    pub ip: AddressInput,

    /// Port spec: a single port, a list of ports, or a string of
    /// comma-separated ports and inclusive ranges like `25565,27015-27020`.
    pub ports: PortsInput,

    #[serde(default, alias = "ipAlias")]
    pub ip_alias: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AddressInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PortsInput {
    Single(u16),
    List(Vec<u16>),
    Spec(String),
}

#[derive(Debug, Serialize)]
pub struct CreateAllocationsResponse {
    pub data: CreatedAllocations,
}

#[derive(Debug, Serialize)]
pub struct CreatedAllocations {
    pub success: bool,
    /// Number of allocations actually inserted; existing pairs are skipped.
    pub created: usize,
    pub allocations: Vec<AllocationResponse>,
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub id: String,
    pub node_id: String,
    pub ip: String,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_alias: Option<String>,
    pub is_primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_id: Option<String>,
    pub held_by_failed_install: bool,
}

impl AllocationResponse {
    fn from_listed(listed: &ListedAllocation) -> Self {
        let a = &listed.allocation;
        Self {
            id: a.allocation_id.clone(),
            node_id: a.node_id.clone(),
            ip: a.ip.clone(),
            port: a.port,
            ip_alias: a.ip_alias.clone(),
            is_primary: a.is_primary,
            workload_id: a.workload_id.clone(),
            held_by_failed_install: listed.held_by_failed_install,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<CreateNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.name.trim().is_empty() || request.fqdn.trim().is_empty() {
        return Err(
            ApiError::bad_request("invalid_node", "name and fqdn are required")
                .with_request_id(ctx.request_id),
        );
    }
    if !matches!(request.scheme.as_str(), "http" | "https") {
        return Err(
            ApiError::bad_request("invalid_node", "scheme must be http or https")
                .with_request_id(ctx.request_id),
        );
    }

    let token_id = random_token(16);
    let token = random_token(64);

    let node = state
        .db()
        .workloads()
        .create_node(
            &NodeId::new().to_string(),
            request.name.trim(),
            request.fqdn.trim(),
            &request.scheme,
            request.daemon_port,
            &token_id,
            &token,
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedNodeResponse {
            node: NodeResponse::from_record(&node),
            daemon_token: token,
        }),
    ))
}

async fn list_nodes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = state
        .db()
        .workloads()
        .list_nodes()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let body: Vec<NodeResponse> = nodes.iter().map(NodeResponse::from_record).collect();
    Ok(Json(body))
}

async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .db()
        .workloads()
        .get_node(&node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?
        .ok_or_else(|| {
            ApiError::not_found("node_not_found", format!("node {node_id} not found"))
                .with_request_id(ctx.request_id)
        })?;

    Ok(Json(NodeResponse::from_record(&node)))
}

async fn list_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_node(&state, &node_id, &ctx.request_id).await?;

    let allocations = state
        .db()
        .allocations()
        .list_for_node(&node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let body: Vec<AllocationResponse> = allocations
        .iter()
        .map(AllocationResponse::from_listed)
        .collect();
    Ok(Json(body))
}

async fn create_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
    Json(request): Json<CreateAllocationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_node(&state, &node_id, &ctx.request_id).await?;

    let specs: Vec<String> = match request.ip {
        AddressInput::One(spec) => vec![spec],
        AddressInput::Many(specs) => specs,
    };

    let limit = state.allocation_expansion_limit();
    let mut ips = Vec::new();
    for spec in &specs {
        let expanded = parse_address_spec(spec, limit).map_err(|e| {
            ApiError::bad_request("invalid_address_spec", e.to_string())
                .with_request_id(ctx.request_id.clone())
        })?;
        ips.extend(expanded);
    }
    ips.sort();
    ips.dedup();
    if ips.len() as u64 > limit {
        return Err(ApiError::bad_request(
            "invalid_address_spec",
            format!("address specs expand to {} addresses, cap is {limit}", ips.len()),
        )
        .with_request_id(ctx.request_id));
    }

    let ports = expand_ports(request.ports)
        .map_err(|message| {
            ApiError::bad_request("invalid_port_spec", message)
                .with_request_id(ctx.request_id.clone())
        })?;

    // The cap bounds the rows a single request may insert, not just the
    // address expansion; every ip pairs with every port.
    let pairs = (ips.len() as u64).saturating_mul(ports.len() as u64);
    if pairs > limit {
        return Err(ApiError::bad_request(
            "allocation_limit_exceeded",
            format!("request expands to {pairs} allocations, cap is {limit}"),
        )
        .with_request_id(ctx.request_id));
    }

    let outcome = state
        .db()
        .allocations()
        .bulk_create(&node_id, &ips, &ports, request.ip_alias.as_deref())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let allocations: Vec<AllocationResponse> = outcome
        .created
        .iter()
        .map(|a| {
            AllocationResponse::from_listed(&ListedAllocation {
                allocation: a.clone(),
                held_by_failed_install: false,
            })
        })
        .collect();

    Ok((
        StatusCode::CREATED,
        Json(CreateAllocationsResponse {
            data: CreatedAllocations {
                success: true,
                created: allocations.len(),
                allocations,
            },
        }),
    ))
}

async fn delete_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((node_id, allocation_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    require_allocation_on_node(&state, &node_id, &allocation_id, &ctx.request_id).await?;

    state
        .db()
        .allocations()
        .delete(&allocation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn release_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((node_id, allocation_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    require_allocation_on_node(&state, &node_id, &allocation_id, &ctx.request_id).await?;

    state
        .db()
        .allocations()
        .release(&allocation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Helpers
// =============================================================================

async fn require_node(
    state: &AppState,
    node_id: &str,
    request_id: &str,
) -> Result<(), ApiError> {
    state
        .db()
        .workloads()
        .get_node(node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?
        .ok_or_else(|| {
            ApiError::not_found("node_not_found", format!("node {node_id} not found"))
                .with_request_id(request_id.to_string())
        })?;

    Ok(())
}

async fn require_allocation_on_node(
    state: &AppState,
    node_id: &str,
    allocation_id: &str,
    request_id: &str,
) -> Result<(), ApiError> {
    let allocation = state
        .db()
        .allocations()
        .get(allocation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    match allocation {
        Some(a) if a.node_id == node_id => Ok(()),
        _ => Err(ApiError::not_found(
            "allocation_not_found",
            format!("allocation {allocation_id} not found on node {node_id}"),
        )
        .with_request_id(request_id.to_string())),
    }
}

fn expand_ports(input: PortsInput) -> Result<Vec<u16>, String> {
    match input {
        PortsInput::Single(port) => expand_ports(PortsInput::List(vec![port])),
        PortsInput::List(ports) => {
            if let Some(bad) = ports.iter().find(|p| **p == 0) {
                return Err(format!("invalid port: {bad}"));
            }
            let mut ports = ports;
            ports.sort_unstable();
            ports.dedup();
            Ok(ports)
        }
        PortsInput::Spec(spec) => parse_port_spec(&spec).map_err(|e| e.to_string()),
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_length_and_charset() {
        let token = random_token(64);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_allocation_request_accepts_all_input_shapes() {
        let single: CreateAllocationsRequest =
            serde_json::from_str(r#"{"ip":"10.0.0.5","ports":25565}"#).unwrap();
        assert!(matches!(single.ip, AddressInput::One(_)));
        assert_eq!(expand_ports(single.ports).unwrap(), vec![25565]);

        let many: CreateAllocationsRequest = serde_json::from_str(
            r#"{"ip":["10.0.0.5","10.0.0.6"],"ports":[25570,25565,25565],"ipAlias":"play.example.com"}"#,
        )
        .unwrap();
        assert!(matches!(many.ip, AddressInput::Many(ref v) if v.len() == 2));
        assert_eq!(expand_ports(many.ports).unwrap(), vec![25565, 25570]);
        assert_eq!(many.ip_alias.as_deref(), Some("play.example.com"));

        let spec: CreateAllocationsRequest =
            serde_json::from_str(r#"{"ip":"10.0.0.0/30","ports":"25565,27015-27017"}"#).unwrap();
        assert_eq!(
            expand_ports(spec.ports).unwrap(),
            vec![25565, 27015, 27016, 27017]
        );
    }

    #[rstest::rstest]
    #[case(PortsInput::Single(0))]
    #[case(PortsInput::List(vec![25565, 0]))]
    #[case(PortsInput::Spec("0".into()))]
    #[case(PortsInput::Spec("25570-25565".into()))]
    fn test_expand_ports_rejects_bad_input(#[case] input: PortsInput) {
        assert!(expand_ports(input).is_err());
    }

    #[test]
    fn test_create_node_request_defaults() {
        let request: CreateNodeRequest =
            serde_json::from_str(r#"{"name":"n1","fqdn":"n1.example.com"}"#).unwrap();
        assert_eq!(request.scheme, "https");
        assert_eq!(request.daemon_port, 8080);
    }
}
