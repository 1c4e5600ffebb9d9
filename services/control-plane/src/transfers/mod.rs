//! Workload transfers between nodes.
//!
//! A transfer moves a workload from its current node to another one by
//! reserving destination allocations up front, asking the source daemon to
//! push the data over, and reconciling ownership when the destination
//! reports the outcome. The active transfer row is the mutex: while it exists,
//! nothing else may move or delete the workload.

mod orchestrator;
mod sweeper;

pub use orchestrator::{
    InitiatedTransfer, TransferError, TransferOrchestrator, TransferOutcome, TransferRequest,
};
pub use sweeper::{TransferSweeper, TransferSweeperConfig};
