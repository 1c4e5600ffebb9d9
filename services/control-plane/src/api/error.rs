use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::{AllocationError, DbError};
use crate::provisioning::ProvisionError;
use crate::transfers::TransferError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://gantry.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            details: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    /// A node daemon refused or could not be reached. Retryable by nature.
    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::BAD_GATEWAY, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        tracing::error!(error = %err, "Database error while handling request");
        Self::internal("database_error", "A database operation failed")
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        let message = err.to_string();
        match err {
            AllocationError::AllConflict => Self::conflict("allocations_exist", message),
            AllocationError::NotFound(_) => Self::not_found("allocation_not_found", message),
            AllocationError::NotFree(_) => Self::conflict("allocation_in_use", message),
            AllocationError::WrongNode { .. } => Self::conflict("allocation_wrong_node", message),
            AllocationError::PrimaryProtected(_) => {
                Self::conflict("allocation_primary_protected", message)
            }
            AllocationError::WorkloadNotFound(_) => {
                Self::not_found("workload_not_found", message)
            }
            AllocationError::WorkloadWithoutNode(_) => {
                Self::conflict("workload_without_node", message)
            }
            AllocationError::Db(err) => {
                tracing::error!(error = %err, "Database error while handling request");
                Self::internal("database_error", "A database operation failed")
            }
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let message = err.to_string();
        match err {
            ProvisionError::WorkloadNotFound(_) => Self::not_found("workload_not_found", message),
            ProvisionError::NodeNotFound(_) => Self::not_found("node_not_found", message),
            ProvisionError::WorkloadWithoutNode(_) => {
                Self::conflict("workload_without_node", message)
            }
            ProvisionError::ActiveTransfer(_) => Self::conflict("transfer_in_flight", message),
            ProvisionError::Allocation(err) => err.into(),
            ProvisionError::Daemon(err) => Self::bad_gateway("daemon_error", err.to_string()),
            ProvisionError::Db(err) => err.into(),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        let message = err.to_string();
        match err {
            TransferError::WorkloadNotFound(_) => Self::not_found("workload_not_found", message),
            TransferError::NodeNotFound(_) => Self::not_found("node_not_found", message),
            TransferError::WorkloadNotPlaced(_) => Self::conflict("workload_not_placed", message),
            TransferError::AlreadyOnTargetNode(_) => {
                Self::conflict("already_on_target_node", message)
            }
            TransferError::ActiveTransferExists(_) => {
                Self::conflict("transfer_in_flight", message)
            }
            TransferError::NoAllocationAvailable(_) => {
                Self::conflict("no_allocation_available", message)
            }
            TransferError::InvalidDestinationAllocation(_) => {
                Self::conflict("invalid_destination_allocation", message)
            }
            TransferError::NoActiveTransfer(_) => Self::conflict("no_active_transfer", message),
            TransferError::Allocation(err) => err.into(),
            TransferError::Daemon(err) => Self::bad_gateway("daemon_error", err.to_string()),
            TransferError::Db(err) => err.into(),
        }
    }
}
