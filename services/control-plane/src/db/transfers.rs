//! Transfer store.
//!
//! A transfer row doubles as the relocation mutex: the partial unique index
//! on `(workload_id) WHERE NOT archived` means at most one un-archived row
//! per workload can exist, and archiving it is the single commit point. The
//! conditional archive UPDATE returns the row only to the first caller, so
//! duplicate or late outcome reports become no-ops.

use chrono::{DateTime, Utc};
use gantry_id::TransferId;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::DbError;

/// A transfer row. `successful` stays NULL while the transfer is in flight
/// and records the outcome once archived.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub transfer_id: String,
    pub workload_id: String,
    pub old_node_id: String,
    pub old_allocation_id: String,
    pub old_additional_allocations: Vec<String>,
    pub new_node_id: String,
    pub new_allocation_id: String,
    pub new_additional_allocations: Vec<String>,
    pub successful: Option<bool>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Transfer {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            transfer_id: row.try_get("transfer_id")?,
            workload_id: row.try_get("workload_id")?,
            old_node_id: row.try_get("old_node_id")?,
            old_allocation_id: row.try_get("old_allocation_id")?,
            old_additional_allocations: row.try_get("old_additional_allocations")?,
            new_node_id: row.try_get("new_node_id")?,
            new_allocation_id: row.try_get("new_allocation_id")?,
            new_additional_allocations: row.try_get("new_additional_allocations")?,
            successful: row.try_get("successful")?,
            archived: row.try_get("archived")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const TRANSFER_COLUMNS: &str = "transfer_id, workload_id, old_node_id, old_allocation_id, \
                                old_additional_allocations, new_node_id, new_allocation_id, \
                                new_additional_allocations, successful, archived, created_at, \
                                updated_at";

/// Input for recording a new in-flight transfer.
#[derive(Debug)]
pub struct NewTransfer<'a> {
    pub workload_id: &'a str,
    pub old_node_id: &'a str,
    pub old_allocation_id: &'a str,
    pub old_additional_allocations: &'a [String],
    pub new_node_id: &'a str,
    pub new_allocation_id: &'a str,
    pub new_additional_allocations: &'a [String],
}

/// Store for transfer rows.
pub struct TransferStore {
    pool: PgPool,
}

impl TransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an active transfer row inside the caller's transaction.
    ///
    /// Returns `Ok(None)` when the partial unique index rejects the insert,
    /// meaning another transfer for the workload is already in flight.
    pub async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        input: NewTransfer<'_>,
    ) -> Result<Option<Transfer>, sqlx::Error> {
        let result = sqlx::query_as::<_, Transfer>(&format!(
            r#"
            INSERT INTO transfers
                (transfer_id, workload_id, old_node_id, old_allocation_id,
                 old_additional_allocations, new_node_id, new_allocation_id,
                 new_additional_allocations)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {TRANSFER_COLUMNS}
            "#,
        ))
        .bind(TransferId::new().to_string())
        .bind(input.workload_id)
        .bind(input.old_node_id)
        .bind(input.old_allocation_id)
        .bind(input.old_additional_allocations)
        .bind(input.new_node_id)
        .bind(input.new_allocation_id)
        .bind(input.new_additional_allocations)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(transfer) => Ok(Some(transfer)),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The workload's active (un-archived) transfer, if any.
    pub async fn get_active_for_workload(
        &self,
        workload_id: &str,
    ) -> Result<Option<Transfer>, DbError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE workload_id = $1 AND NOT archived",
        ))
        .bind(workload_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Archive the workload's active transfer, recording its outcome.
    ///
    /// The WHERE clause carries the full claim: the row must still be
    /// un-archived, and when `reporter_node_id` is given it must match the
    /// transfer's destination node. Returns `None` when no row qualified,
    /// in which case the caller must change nothing else.
    pub async fn archive_active_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        successful: bool,
        reporter_node_id: Option<&str>,
    ) -> Result<Option<Transfer>, sqlx::Error> {
        sqlx::query_as::<_, Transfer>(&format!(
            r#"
            UPDATE transfers
            SET archived = true, successful = $1, updated_at = now()
            WHERE workload_id = $2
              AND NOT archived
              AND ($3::TEXT IS NULL OR new_node_id = $3)
            RETURNING {TRANSFER_COLUMNS}
            "#,
        ))
        .bind(successful)
        .bind(workload_id)
        .bind(reporter_node_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Archive a specific transfer by id if it is still active. Sweeper
    /// path; same at-most-once contract as [`archive_active_in`].
    pub async fn archive_by_id_in(
        tx: &mut Transaction<'_, Postgres>,
        transfer_id: &str,
        successful: bool,
    ) -> Result<Option<Transfer>, sqlx::Error> {
        sqlx::query_as::<_, Transfer>(&format!(
            r#"
            UPDATE transfers
            SET archived = true, successful = $1, updated_at = now()
            WHERE transfer_id = $2 AND NOT archived
            RETURNING {TRANSFER_COLUMNS}
            "#,
        ))
        .bind(successful)
        .bind(transfer_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Active transfers started before the cutoff, oldest first.
    pub async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transfer>, DbError> {
        sqlx::query_as::<_, Transfer>(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS} FROM transfers
            WHERE NOT archived AND created_at < $1
            ORDER BY created_at
            "#,
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Archived transfer history for a workload, newest first.
    pub async fn list_for_workload(&self, workload_id: &str) -> Result<Vec<Transfer>, DbError> {
        sqlx::query_as::<_, Transfer>(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS} FROM transfers
            WHERE workload_id = $1
            ORDER BY created_at DESC
            "#,
        ))
        .bind(workload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
