//! Operator-facing admin API.

mod nodes;
mod workloads;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::routes())
        .nest("/workloads", workloads::routes())
}
