//! Stale transfer sweeper.
//!
//! A daemon that dies mid-transfer never reports an outcome, which
//! would leave the workload's relocation mutex held forever. The sweeper
//! force-fails any active transfer older than the expiry, using the same
//! conditional archive as an outcome report so a racing real report and the
//! sweeper cannot both win.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::db::{Database, TransferStore};
use crate::transfers::TransferOrchestrator;

#[derive(Debug, Clone)]
pub struct TransferSweeperConfig {
    pub interval: Duration,
    /// Age after which an active transfer is considered abandoned.
    pub expiry: Duration,
}

impl Default for TransferSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            expiry: Duration::from_secs(900),
        }
    }
}

pub struct TransferSweeper {
    db: Database,
    config: TransferSweeperConfig,
}

impl TransferSweeper {
    pub fn new(db: Database, config: TransferSweeperConfig) -> Self {
        Self { db, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            expiry_secs = self.config.expiry.as_secs(),
            "Starting transfer sweeper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Transfer sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.expiry)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));

        let stale = match self.db.transfers().list_stale_active(cutoff).await {
            Ok(stale) => stale,
            Err(err) => {
                error!(error = %err, "Failed to list stale transfers");
                return;
            }
        };

        let mut swept = 0u64;
        for transfer in stale {
            match self.force_fail(&transfer.transfer_id).await {
                Ok(true) => {
                    warn!(
                        transfer_id = %transfer.transfer_id,
                        workload_id = %transfer.workload_id,
                        age_secs = (Utc::now() - transfer.created_at).num_seconds(),
                        "Force-failed stale transfer"
                    );
                    swept += 1;
                }
                // Lost the race to a real outcome report.
                Ok(false) => {}
                Err(err) => {
                    error!(
                        transfer_id = %transfer.transfer_id,
                        error = %err,
                        "Failed to sweep stale transfer"
                    );
                }
            }
        }

        if swept > 0 {
            info!(swept, "Transfer sweep complete");
        }
    }

    async fn force_fail(&self, transfer_id: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.db.pool().begin().await?;

        let archived = TransferStore::archive_by_id_in(&mut tx, transfer_id, false).await?;
        let Some(transfer) = archived else {
            tx.rollback().await?;
            return Ok(false);
        };

        TransferOrchestrator::roll_back_in(&mut tx, &transfer).await?;
        tx.commit().await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransferSweeperConfig::default();
        assert_eq!(config.interval.as_secs(), 60);
        assert_eq!(config.expiry.as_secs(), 900);
    }
}
