//! Application state shared across request handlers.

use std::sync::Arc;

use crate::daemon::DaemonGateway;
use crate::db::Database;
use crate::provisioning::ProvisioningCoordinator;
use crate::transfers::TransferOrchestrator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    provisioning: ProvisioningCoordinator,
    transfers: TransferOrchestrator,
    allocation_expansion_limit: u64,
}

impl AppState {
    pub fn new(
        db: Database,
        daemon: Arc<dyn DaemonGateway>,
        allocation_expansion_limit: u64,
    ) -> Self {
        let provisioning = ProvisioningCoordinator::new(db.clone(), daemon.clone());
        let transfers = TransferOrchestrator::new(db.clone(), daemon);

        Self {
            inner: Arc::new(AppStateInner {
                db,
                provisioning,
                transfers,
                allocation_expansion_limit,
            }),
        }
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn provisioning(&self) -> &ProvisioningCoordinator {
        &self.inner.provisioning
    }

    pub fn transfers(&self) -> &TransferOrchestrator {
        &self.inner.transfers
    }

    /// Cap on CIDR expansion and on the ip x port pairs one request may create.
    pub fn allocation_expansion_limit(&self) -> u64 {
        self.inner.allocation_expansion_limit
    }
}
