//! Inbound node daemon authentication.
//!
//! Daemons authenticate with `Authorization: Bearer <token_id>.<token>`.
//! The token id selects the node row; the secret half is compared through
//! SHA-256 digests so the comparison does not short-circuit on length.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use crate::api::error::ApiError;
use crate::api::request_context::header_string;
use crate::db::NodeRecord;
use crate::state::AppState;

/// The authenticated node behind a `/remote` request.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node: NodeRecord,
}

fn invalid() -> ApiError {
    ApiError::unauthorized("invalid_node_token", "Node credentials were not accepted")
}

impl FromRequestParts<AppState> for NodeIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = header_string(&parts.headers, "authorization").ok_or_else(invalid)?;

        let bearer = auth.trim().strip_prefix("Bearer ").ok_or_else(invalid)?;
        let (token_id, token) = bearer.trim().split_once('.').ok_or_else(invalid)?;
        if token_id.is_empty() || token.is_empty() {
            return Err(invalid());
        }

        let node = state
            .db()
            .workloads()
            .get_node_by_token_id(token_id)
            .await?
            .ok_or_else(invalid)?;

        let presented = Sha256::digest(token.as_bytes());
        let stored = Sha256::digest(node.daemon_token.as_bytes());
        if presented != stored {
            return Err(invalid());
        }

        Ok(Self { node })
    }
}
