//! Provisioning coordinator.
//!
//! Owns the placement side of a workload's life: claim a primary allocation,
//! record the workload as `installing`, hand it to the node daemon, and keep
//! the database honest when the daemon says no. A failed install keeps its
//! allocation claim so a retry lands on the same address.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::daemon::{DaemonError, DaemonGateway, NodeRoute, PortBinding, WorkloadSpec};
use crate::db::{
    AllocationError, AllocationStore, Database, DbError, NewWorkload, Workload, WorkloadStatus,
    WorkloadStore,
};

/// Errors from provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("workload {0} has no node assigned")]
    WorkloadWithoutNode(String),

    #[error("workload {0} has a transfer in flight")]
    ActiveTransfer(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<sqlx::Error> for ProvisionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(DbError::Query(err))
    }
}

/// Input for provisioning a new workload.
#[derive(Debug)]
pub struct ProvisionRequest {
    pub name: String,
    pub node_id: String,
    pub allocation_id: String,
    pub owner_id: String,
    pub image_ref: String,
    pub start_on_completion: bool,
}

/// Coordinates workload placement against the database and node daemons.
#[derive(Clone)]
pub struct ProvisioningCoordinator {
    db: Database,
    daemon: Arc<dyn DaemonGateway>,
}

impl ProvisioningCoordinator {
    pub fn new(db: Database, daemon: Arc<dyn DaemonGateway>) -> Self {
        Self { db, daemon }
    }

    /// Create the workload record and claim its primary allocation.
    ///
    /// The record starts in `installing`; [`install`](Self::install) carries
    /// it to the daemon. Creation and the claim run in one transaction, so a
    /// failed claim rolls the record back and nothing half-placed lingers.
    #[instrument(skip(self, request), fields(node_id = %request.node_id))]
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Workload, ProvisionError> {
        let workloads = self.db.workloads();

        let node = workloads
            .get_node(&request.node_id)
            .await?
            .ok_or_else(|| ProvisionError::NodeNotFound(request.node_id.clone()))?;

        let mut tx = self.db.pool().begin().await?;

        let workload = WorkloadStore::create_in(
            &mut tx,
            NewWorkload {
                name: request.name,
                node_id: node.node_id.clone(),
                owner_id: request.owner_id,
                image_ref: request.image_ref,
                start_on_completion: request.start_on_completion,
            },
        )
        .await?;

        let claim = AllocationStore::assign_primary_in(
            &mut tx,
            &workload.workload_id,
            &request.allocation_id,
        )
        .await;

        if let Err(err) = claim {
            warn!(
                workload_id = %workload.workload_id,
                allocation_id = %request.allocation_id,
                error = %err,
                "Allocation claim failed, rolling back workload record"
            );
            return Err(err.into());
        }

        tx.commit().await?;

        info!(
            workload_id = %workload.workload_id,
            uuid = %workload.uuid,
            allocation_id = %request.allocation_id,
            "Workload provisioned, pending install"
        );

        // Re-read so primary_allocation_id reflects the claim.
        workloads
            .get(&workload.workload_id)
            .await?
            .ok_or_else(|| ProvisionError::WorkloadNotFound(workload.workload_id.clone()))
    }

    /// Hand the workload to its node daemon for create + install.
    ///
    /// On daemon failure the workload is marked `install_failed` and its
    /// allocations stay claimed; a later [`reinstall`](Self::reinstall)
    /// reuses them.
    #[instrument(skip(self))]
    pub async fn install(&self, workload_id: &str) -> Result<(), ProvisionError> {
        let (workload, route) = self.load_routed(workload_id).await?;
        let spec = self.build_spec(&workload).await?;

        match self.daemon.create_and_install(&route, &spec).await {
            Ok(()) => {
                info!(workload_id, uuid = %workload.uuid, "Daemon accepted install");
                Ok(())
            }
            Err(err) => {
                error!(workload_id, error = %err, "Install failed, allocation retained");
                self.db
                    .workloads()
                    .set_status(workload_id, Some(WorkloadStatus::InstallFailed))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Wipe and reinstall the workload in place on its current node.
    #[instrument(skip(self))]
    pub async fn reinstall(&self, workload_id: &str) -> Result<(), ProvisionError> {
        let (workload, route) = self.load_routed(workload_id).await?;

        if self.db.workloads().is_transferring(workload_id).await? {
            return Err(ProvisionError::ActiveTransfer(workload_id.to_string()));
        }

        self.db
            .workloads()
            .set_status(workload_id, Some(WorkloadStatus::Installing))
            .await?;

        match self.daemon.reinstall_workload(&route, workload.uuid).await {
            Ok(()) => {
                info!(workload_id, "Daemon accepted reinstall");
                Ok(())
            }
            Err(err) => {
                error!(workload_id, error = %err, "Reinstall failed");
                self.db
                    .workloads()
                    .set_status(workload_id, Some(WorkloadStatus::InstallFailed))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Ask the daemon to re-pull the workload's configuration. No state
    /// changes on this side.
    #[instrument(skip(self))]
    pub async fn resync(&self, workload_id: &str) -> Result<(), ProvisionError> {
        let (workload, route) = self.load_routed(workload_id).await?;
        self.daemon.resync(&route, workload.uuid).await?;
        Ok(())
    }

    /// Delete a workload: remove it from its daemon (best effort), release
    /// every allocation it holds, then drop the record.
    ///
    /// Refused while a transfer is in flight; the transfer must finish or be
    /// swept first, otherwise two daemons would disagree about who owns the
    /// workload.
    #[instrument(skip(self))]
    pub async fn delete(&self, workload_id: &str) -> Result<(), ProvisionError> {
        let workloads = self.db.workloads();
        let workload = workloads
            .get(workload_id)
            .await?
            .ok_or_else(|| ProvisionError::WorkloadNotFound(workload_id.to_string()))?;

        if workloads.is_transferring(workload_id).await? {
            return Err(ProvisionError::ActiveTransfer(workload_id.to_string()));
        }

        if let Some(node_id) = &workload.node_id {
            match workloads.get_node(node_id).await? {
                Some(node) => {
                    let route = NodeRoute::from_node(&node);
                    if let Err(err) = self.daemon.delete_workload(&route, workload.uuid).await {
                        warn!(
                            workload_id,
                            node_id = %node_id,
                            error = %err,
                            "Daemon delete failed, removing record anyway"
                        );
                    }
                }
                None => {
                    warn!(workload_id, node_id = %node_id, "Node record missing during delete");
                }
            }
        }

        let mut tx = self.db.pool().begin().await?;
        crate::db::AllocationStore::release_all_for_workload_in(&mut tx, workload_id).await?;
        WorkloadStore::delete_in(&mut tx, workload_id).await?;
        tx.commit().await?;

        info!(workload_id, uuid = %workload.uuid, "Workload deleted");
        Ok(())
    }

    async fn load_routed(&self, workload_id: &str) -> Result<(Workload, NodeRoute), ProvisionError> {
        let workloads = self.db.workloads();

        let workload = workloads
            .get(workload_id)
            .await?
            .ok_or_else(|| ProvisionError::WorkloadNotFound(workload_id.to_string()))?;

        let node_id = workload
            .node_id
            .clone()
            .ok_or_else(|| ProvisionError::WorkloadWithoutNode(workload_id.to_string()))?;

        let node = workloads
            .get_node(&node_id)
            .await?
            .ok_or(ProvisionError::NodeNotFound(node_id))?;

        Ok((workload, NodeRoute::from_node(&node)))
    }

    /// Build the daemon-facing spec from the workload's current bindings.
    pub(crate) async fn build_spec(&self, workload: &Workload) -> Result<WorkloadSpec, ProvisionError> {
        let allocations = self.db.allocations();

        let primary_id = workload.primary_allocation_id.as_deref().ok_or_else(|| {
            ProvisionError::WorkloadWithoutNode(workload.workload_id.clone())
        })?;

        let primary = allocations
            .get(primary_id)
            .await?
            .ok_or_else(|| AllocationError::NotFound(primary_id.to_string()))?;

        let node_id = workload
            .node_id
            .as_deref()
            .ok_or_else(|| ProvisionError::WorkloadWithoutNode(workload.workload_id.clone()))?;

        let mut additional = Vec::new();
        for id in allocations
            .additional_ids_for_workload(&workload.workload_id, node_id)
            .await?
        {
            if let Some(alloc) = allocations.get(&id).await? {
                additional.push(binding(&alloc));
            }
        }

        Ok(WorkloadSpec {
            uuid: workload.uuid,
            name: workload.name.clone(),
            image_ref: workload.image_ref.clone(),
            start_on_completion: workload.start_on_completion,
            primary: binding(&primary),
            additional,
        })
    }
}

pub(crate) fn binding(alloc: &crate::db::Allocation) -> PortBinding {
    PortBinding {
        ip: alloc.ip.clone(),
        port: alloc.port as u16,
        ip_alias: alloc.ip_alias.clone(),
    }
}
