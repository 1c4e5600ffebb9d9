//! Transfer orchestration.
//!
//! `initiate` runs one transaction that reserves every destination
//! allocation and inserts the active transfer row; the partial unique index
//! on un-archived transfers makes the insert the serialization point, so
//! two racing initiations cannot both reserve. `report_outcome` runs one
//! transaction whose first statement is a conditional archive UPDATE; only
//! the caller that actually flips `archived` applies the commit or rollback
//! branch, which makes duplicate and late reports harmless.

use std::sync::Arc;

use sqlx::{Postgres, Transaction as PgTransaction};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::daemon::{DaemonError, DaemonGateway, NodeRoute, TransferTicket};
use crate::db::{
    Allocation, AllocationError, AllocationStore, Database, DbError, NewTransfer, Transfer,
    TransferStore, WorkloadStatus, WorkloadStore,
};
use crate::provisioning::binding;

/// Errors from transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("workload {0} has no node or primary allocation to move from")]
    WorkloadNotPlaced(String),

    #[error("workload {0} is already on the target node")]
    AlreadyOnTargetNode(String),

    #[error("workload {0} already has a transfer in flight")]
    ActiveTransferExists(String),

    #[error("no free allocation available on node {0}")]
    NoAllocationAvailable(String),

    #[error("allocation {0} is not a free allocation on the target node")]
    InvalidDestinationAllocation(String),

    #[error("workload {0} has no transfer in flight")]
    NoActiveTransfer(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<sqlx::Error> for TransferError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(DbError::Query(err))
    }
}

/// Input for starting a transfer.
#[derive(Debug)]
pub struct TransferRequest {
    pub workload_id: String,
    pub target_node_id: String,
    /// Explicit destination primary allocation; auto-selected when absent,
    /// preferring a free allocation on the old primary's IP.
    pub allocation_id: Option<String>,
    /// Explicit destination additional allocations; auto-selected to match
    /// the source's additional allocation count when absent.
    pub additional_allocation_ids: Option<Vec<String>>,
}

/// A successfully started transfer.
#[derive(Debug)]
pub struct InitiatedTransfer {
    pub transfer: Transfer,
    /// Whether the source daemon accepted the push request. When false the
    /// transfer stays active until the outcome report or the sweeper ends
    /// it.
    pub push_accepted: bool,
}

/// Resolution of an outcome report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Workload now lives on the destination node.
    Committed,
    /// Reservations rolled back; workload marked `transfer_failed` on its
    /// original node.
    RolledBack,
}

/// Coordinates transfers against the database and node daemons.
#[derive(Clone)]
pub struct TransferOrchestrator {
    db: Database,
    daemon: Arc<dyn DaemonGateway>,
}

impl TransferOrchestrator {
    pub fn new(db: Database, daemon: Arc<dyn DaemonGateway>) -> Self {
        Self { db, daemon }
    }

    /// Start moving a workload to another node.
    ///
    /// Reserves a destination primary (plus one destination allocation per
    /// source-side additional allocation) and records the active transfer,
    /// all in one transaction, then asks the source daemon to push.
    #[instrument(skip(self, request), fields(workload_id = %request.workload_id, target = %request.target_node_id))]
    pub async fn initiate(
        &self,
        request: TransferRequest,
    ) -> Result<InitiatedTransfer, TransferError> {
        let workloads = self.db.workloads();
        let allocations = self.db.allocations();

        let workload = workloads
            .get(&request.workload_id)
            .await?
            .ok_or_else(|| TransferError::WorkloadNotFound(request.workload_id.clone()))?;

        let (source_node_id, old_primary_id) = match (&workload.node_id, &workload.primary_allocation_id)
        {
            (Some(node), Some(primary)) => (node.clone(), primary.clone()),
            _ => return Err(TransferError::WorkloadNotPlaced(workload.workload_id)),
        };

        if source_node_id == request.target_node_id {
            return Err(TransferError::AlreadyOnTargetNode(workload.workload_id));
        }

        let source_node = workloads
            .get_node(&source_node_id)
            .await?
            .ok_or_else(|| TransferError::NodeNotFound(source_node_id.clone()))?;
        let target_node = workloads
            .get_node(&request.target_node_id)
            .await?
            .ok_or_else(|| TransferError::NodeNotFound(request.target_node_id.clone()))?;

        let old_primary = allocations
            .get(&old_primary_id)
            .await?
            .ok_or_else(|| TransferError::WorkloadNotPlaced(workload.workload_id.clone()))?;
        let old_additional = allocations
            .additional_ids_for_workload(&workload.workload_id, &source_node_id)
            .await?;

        let mut tx = self.db.pool().begin().await?;

        let new_primary = match &request.allocation_id {
            Some(id) => AllocationStore::lock_specific_free_in(&mut tx, &target_node.node_id, id)
                .await?
                .ok_or_else(|| TransferError::InvalidDestinationAllocation(id.clone()))?,
            None => AllocationStore::lock_free_batch_in(
                &mut tx,
                &target_node.node_id,
                Some(old_primary.ip.as_str()),
                &[],
                1,
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransferError::NoAllocationAvailable(target_node.node_id.clone()))?,
        };

        let new_additional = match &request.additional_allocation_ids {
            Some(ids) => {
                let mut picked = Vec::with_capacity(ids.len());
                for id in ids {
                    if *id == new_primary.allocation_id
                        || picked.iter().any(|a: &Allocation| a.allocation_id == *id)
                    {
                        return Err(TransferError::InvalidDestinationAllocation(id.clone()));
                    }
                    let alloc =
                        AllocationStore::lock_specific_free_in(&mut tx, &target_node.node_id, id)
                            .await?
                            .ok_or_else(|| {
                                TransferError::InvalidDestinationAllocation(id.clone())
                            })?;
                    picked.push(alloc);
                }
                picked
            }
            None if old_additional.is_empty() => Vec::new(),
            None => {
                let picked = AllocationStore::lock_free_batch_in(
                    &mut tx,
                    &target_node.node_id,
                    None,
                    std::slice::from_ref(&new_primary.allocation_id),
                    old_additional.len() as i64,
                )
                .await?;

                if picked.len() < old_additional.len() {
                    return Err(TransferError::NoAllocationAvailable(
                        target_node.node_id.clone(),
                    ));
                }
                picked
            }
        };

        let mut reserved: Vec<String> = vec![new_primary.allocation_id.clone()];
        reserved.extend(new_additional.iter().map(|a| a.allocation_id.clone()));

        // Reserved but not promoted: the destination primary only becomes
        // primary when the outcome report commits the move.
        AllocationStore::reserve_in(&mut tx, &workload.workload_id, &reserved).await?;

        let new_additional_ids: Vec<String> = new_additional
            .iter()
            .map(|a| a.allocation_id.clone())
            .collect();

        let transfer = TransferStore::insert_in(
            &mut tx,
            NewTransfer {
                workload_id: &workload.workload_id,
                old_node_id: &source_node_id,
                old_allocation_id: &old_primary_id,
                old_additional_allocations: &old_additional,
                new_node_id: &target_node.node_id,
                new_allocation_id: &new_primary.allocation_id,
                new_additional_allocations: &new_additional_ids,
            },
        )
        .await?
        .ok_or_else(|| TransferError::ActiveTransferExists(workload.workload_id.clone()))?;

        tx.commit().await?;

        info!(
            transfer_id = %transfer.transfer_id,
            from = %source_node_id,
            to = %target_node.node_id,
            "Transfer initiated"
        );

        let target_route = NodeRoute::from_node(&target_node);
        let ticket = TransferTicket {
            destination_url: target_route.base_url,
            destination_bearer: target_route.bearer,
            primary: binding(&new_primary),
            additional: new_additional.iter().map(binding).collect(),
        };

        let source_route = NodeRoute::from_node(&source_node);
        let push_accepted = match self
            .daemon
            .push_transfer(&source_route, workload.uuid, &ticket)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                // The transfer row stays active; the destination may still
                // report an outcome, and the sweeper force-fails it otherwise.
                warn!(
                    transfer_id = %transfer.transfer_id,
                    error = %err,
                    "Source daemon rejected transfer push"
                );
                false
            }
        };

        Ok(InitiatedTransfer {
            transfer,
            push_accepted,
        })
    }

    /// Apply the destination daemon's outcome report for a workload's transfer.
    ///
    /// `reporter_node_id` must be the transfer's destination node; reports
    /// from anyone else do not match the archive predicate and change nothing.
    #[instrument(skip(self))]
    pub async fn report_outcome(
        &self,
        uuid: Uuid,
        successful: bool,
        reporter_node_id: Option<&str>,
    ) -> Result<TransferOutcome, TransferError> {
        let workload = self
            .db
            .workloads()
            .get_by_uuid(uuid)
            .await?
            .ok_or_else(|| TransferError::WorkloadNotFound(uuid.to_string()))?;

        let mut tx = self.db.pool().begin().await?;

        let transfer = TransferStore::archive_active_in(
            &mut tx,
            &workload.workload_id,
            successful,
            reporter_node_id,
        )
        .await?
        .ok_or_else(|| TransferError::NoActiveTransfer(workload.workload_id.clone()))?;

        let outcome = if successful {
            Self::commit_in(&mut tx, &transfer).await?;
            TransferOutcome::Committed
        } else {
            Self::roll_back_in(&mut tx, &transfer).await?;
            TransferOutcome::RolledBack
        };

        tx.commit().await?;

        info!(
            transfer_id = %transfer.transfer_id,
            outcome = ?outcome,
            "Transfer outcome applied"
        );

        // The source daemon keeps its copy until told otherwise.
        if outcome == TransferOutcome::Committed {
            self.cleanup_source(&transfer, uuid).await;
        }

        Ok(outcome)
    }

    /// Commit branch: old allocations freed, destination primary promoted,
    /// workload re-homed, status cleared.
    async fn commit_in(
        tx: &mut PgTransaction<'_, Postgres>,
        transfer: &Transfer,
    ) -> Result<(), sqlx::Error> {
        let mut old_ids = vec![transfer.old_allocation_id.clone()];
        old_ids.extend(transfer.old_additional_allocations.iter().cloned());
        AllocationStore::release_ids_in(tx, &old_ids).await?;

        let mut new_ids = vec![transfer.new_allocation_id.clone()];
        new_ids.extend(transfer.new_additional_allocations.iter().cloned());
        AllocationStore::assign_on_node_in(tx, &transfer.workload_id, &transfer.new_node_id, &new_ids)
            .await?;
        AllocationStore::promote_primary_in(tx, &transfer.workload_id, &transfer.new_allocation_id)
            .await?;
        WorkloadStore::relocate_in(
            tx,
            &transfer.workload_id,
            &transfer.new_node_id,
            &transfer.new_allocation_id,
        )
        .await?;
        WorkloadStore::set_status_in(tx, &transfer.workload_id, None).await?;

        Ok(())
    }

    /// Rollback branch: destination reservations freed, workload left on
    /// its original node in `transfer_failed`. Shared with the sweeper.
    pub(crate) async fn roll_back_in(
        tx: &mut PgTransaction<'_, Postgres>,
        transfer: &Transfer,
    ) -> Result<(), sqlx::Error> {
        let mut new_ids = vec![transfer.new_allocation_id.clone()];
        new_ids.extend(transfer.new_additional_allocations.iter().cloned());
        AllocationStore::release_ids_in(tx, &new_ids).await?;

        WorkloadStore::set_status_in(
            tx,
            &transfer.workload_id,
            Some(WorkloadStatus::TransferFailed),
        )
        .await?;

        Ok(())
    }

    /// Best-effort removal of the committed workload from its old node.
    async fn cleanup_source(&self, transfer: &Transfer, uuid: Uuid) {
        let node = match self.db.workloads().get_node(&transfer.old_node_id).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(node_id = %transfer.old_node_id, "Source node missing after commit");
                return;
            }
            Err(err) => {
                error!(error = %err, "Failed to load source node after commit");
                return;
            }
        };

        let route = NodeRoute::from_node(&node);
        if let Err(err) = self.daemon.delete_workload(&route, uuid).await {
            warn!(
                node_id = %transfer.old_node_id,
                uuid = %uuid,
                error = %err,
                "Failed to remove source copy after committed transfer"
            );
        }
    }
}
