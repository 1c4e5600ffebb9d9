//! Workload admin endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::{Transfer, Workload};
use crate::provisioning::ProvisionRequest;
use crate::state::AppState;
use crate::transfers::TransferRequest;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_workload).get(list_workloads))
        .route("/{workload_id}", get(get_workload).delete(delete_workload))
        .route("/{workload_id}/reinstall", post(reinstall_workload))
        .route("/{workload_id}/resync", post(resync_workload))
        .route("/{workload_id}/transfer", post(transfer_workload))
        .route("/{workload_id}/transfers", get(list_transfers))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWorkloadRequest {
    pub name: String,
    pub node_id: String,
    pub allocation_id: String,
    pub owner_id: String,
    pub image_ref: String,
    #[serde(default)]
    pub start_on_completion: bool,
}

#[derive(Debug, Serialize)]
pub struct WorkloadResponse {
    pub id: String,
    pub uuid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_allocation_id: Option<String>,
    /// Lifecycle status; absent means installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub owner_id: String,
    pub image_ref: String,
    pub start_on_completion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_transferring: Option<bool>,
    pub created_at: String,
}

impl WorkloadResponse {
    fn from_workload(workload: &Workload, is_transferring: Option<bool>) -> Self {
        Self {
            id: workload.workload_id.clone(),
            uuid: workload.uuid.to_string(),
            name: workload.name.clone(),
            node_id: workload.node_id.clone(),
            primary_allocation_id: workload.primary_allocation_id.clone(),
            status: workload.status.map(|s| s.as_str().to_string()),
            owner_id: workload.owner_id.clone(),
            image_ref: workload.image_ref.clone(),
            start_on_completion: workload.start_on_completion,
            is_transferring,
            created_at: workload.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferWorkloadRequest {
    pub node_id: String,
    /// Explicit destination primary allocation; auto-selected when absent.
    #[serde(default)]
    pub allocation_id: Option<String>,
    /// Explicit destination additional allocations; auto-selected to match
    /// the source's additional count when absent.
    #[serde(default)]
    pub additional_allocation_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub id: String,
    pub workload_id: String,
    pub old_node_id: String,
    pub new_node_id: String,
    pub new_allocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    pub archived: bool,
    pub created_at: String,
}

impl TransferResponse {
    fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            id: transfer.transfer_id.clone(),
            workload_id: transfer.workload_id.clone(),
            old_node_id: transfer.old_node_id.clone(),
            new_node_id: transfer.new_node_id.clone(),
            new_allocation_id: transfer.new_allocation_id.clone(),
            successful: transfer.successful,
            archived: transfer.archived,
            created_at: transfer.created_at.to_rfc3339(),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a workload and kick off its install.
///
/// Returns 202: the record exists and its primary allocation is claimed,
/// but the daemon install runs in the background. Poll the workload's
/// `status` to observe the result.
async fn create_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<CreateWorkloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.name.trim().is_empty()
        || request.image_ref.trim().is_empty()
        || request.owner_id.trim().is_empty()
    {
        return Err(ApiError::bad_request(
            "invalid_workload",
            "name, image_ref and owner_id are required",
        )
        .with_request_id(ctx.request_id));
    }

    let workload = state
        .provisioning()
        .provision(ProvisionRequest {
            name: request.name.trim().to_string(),
            node_id: request.node_id,
            allocation_id: request.allocation_id,
            owner_id: request.owner_id,
            image_ref: request.image_ref,
            start_on_completion: request.start_on_completion,
        })
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let coordinator = state.provisioning().clone();
    let workload_id = workload.workload_id.clone();
    tokio::spawn(async move {
        if let Err(err) = coordinator.install(&workload_id).await {
            error!(workload_id = %workload_id, error = %err, "Background install failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(WorkloadResponse::from_workload(&workload, None)),
    ))
}

async fn list_workloads(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let workloads = state
        .db()
        .workloads()
        .list()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let body: Vec<WorkloadResponse> = workloads
        .iter()
        .map(|w| WorkloadResponse::from_workload(w, None))
        .collect();
    Ok(Json(body))
}

async fn get_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workload = require_workload(&state, &workload_id, &ctx.request_id).await?;

    let is_transferring = state
        .db()
        .workloads()
        .is_transferring(&workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(Json(WorkloadResponse::from_workload(
        &workload,
        Some(is_transferring),
    )))
}

/// Delete a workload. Refused with 409 while a transfer is in flight.
async fn delete_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .provisioning()
        .delete(&workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn reinstall_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .provisioning()
        .reinstall(&workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(StatusCode::ACCEPTED)
}

async fn resync_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .provisioning()
        .resync(&workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Start moving a workload to another node. Returns 202: the destination is
/// reserved and the source daemon has been asked to push; the outcome
/// arrives later on the remote reporting endpoint.
async fn transfer_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
    Json(request): Json<TransferWorkloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let initiated = state
        .transfers()
        .initiate(TransferRequest {
            workload_id,
            target_node_id: request.node_id,
            allocation_id: request.allocation_id,
            additional_allocation_ids: request.additional_allocation_ids,
        })
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TransferResponse::from_transfer(&initiated.transfer)),
    ))
}

async fn list_transfers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_workload(&state, &workload_id, &ctx.request_id).await?;

    let transfers = state
        .db()
        .transfers()
        .list_for_workload(&workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let body: Vec<TransferResponse> = transfers.iter().map(TransferResponse::from_transfer).collect();
    Ok(Json(body))
}

async fn require_workload(
    state: &AppState,
    workload_id: &str,
    request_id: &str,
) -> Result<Workload, ApiError> {
    state
        .db()
        .workloads()
        .get(workload_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?
        .ok_or_else(|| {
            ApiError::not_found(
                "workload_not_found",
                format!("workload {workload_id} not found"),
            )
            .with_request_id(request_id.to_string())
        })
}
