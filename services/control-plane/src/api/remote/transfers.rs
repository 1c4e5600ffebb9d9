//! Transfer outcome reporting from destination daemons.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::node_identity::NodeIdentity;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::transfers::TransferOutcome;

#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    pub data: OutcomeData,
}

#[derive(Debug, Serialize)]
pub struct OutcomeData {
    /// Always true in a 200 response: the report was applied. Rejections
    /// surface as problem responses, never through this field.
    pub success: bool,
    /// `"transfer_failed"` after a rollback, null after a commit.
    pub status: Option<String>,
}

/// `POST /remote/workloads/{uuid}/transfer/{status}`
///
/// The destination daemon reports whether the incoming transfer landed.
/// `status` is the literal `success` or `failure`. Only the transfer's
/// destination node is accepted as a reporter, and only the first report for
/// a transfer has any effect.
pub async fn report_transfer_outcome(
    State(state): State<AppState>,
    ctx: RequestContext,
    identity: NodeIdentity,
    Path((uuid, status)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid: Uuid = uuid.parse().map_err(|_| {
        ApiError::bad_request("invalid_uuid", "workload uuid is not a valid UUID")
            .with_request_id(ctx.request_id.clone())
    })?;

    let successful = match status.as_str() {
        "success" => true,
        "failure" => false,
        other => {
            return Err(ApiError::bad_request(
                "invalid_transfer_status",
                format!("transfer status must be 'success' or 'failure', got '{other}'"),
            )
            .with_request_id(ctx.request_id));
        }
    };

    let outcome = state
        .transfers()
        .report_outcome(uuid, successful, Some(&identity.node.node_id))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;

    let data = match outcome {
        TransferOutcome::Committed => OutcomeData {
            success: true,
            status: None,
        },
        TransferOutcome::RolledBack => OutcomeData {
            success: true,
            status: Some("transfer_failed".to_string()),
        },
    };

    Ok(Json(OutcomeResponse { data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_response_shapes() {
        let committed = OutcomeResponse {
            data: OutcomeData {
                success: true,
                status: None,
            },
        };
        let json = serde_json::to_value(&committed).unwrap();
        assert_eq!(json["data"]["success"], true);
        assert!(json["data"]["status"].is_null());

        let rolled_back = OutcomeResponse {
            data: OutcomeData {
                success: true,
                status: Some("transfer_failed".to_string()),
            },
        };
        let json = serde_json::to_value(&rolled_back).unwrap();
        assert_eq!(json["data"]["success"], true);
        assert_eq!(json["data"]["status"], "transfer_failed");
    }
}
