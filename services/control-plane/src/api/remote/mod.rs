//! Daemon-facing remote API.
//!
//! Everything under `/remote` is called by node daemons, authenticated with
//! their node token. Workloads are addressed by uuid here; internal row ids
//! never appear on this surface.

mod transfers;

use axum::{routing::post, Router};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/workloads/{uuid}/transfer/{status}",
        post(transfers::report_transfer_outcome),
    )
}
