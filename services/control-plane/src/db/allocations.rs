//! Allocation pool store.
//!
//! Allocations are `(node, ip, port)` triples, optionally owned by a
//! workload, with at most one primary allocation per workload. All mutating
//! paths check "is this allocation still free and on the right node" inside
//! the same transaction that claims it, so two concurrent callers can never
//! claim the same free allocation.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use gantry_id::AllocationId;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

/// Errors from allocation pool operations.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Every candidate `(ip, port)` pair already existed.
    #[error("every candidate allocation already exists on this node")]
    AllConflict,

    /// Allocation does not exist.
    #[error("allocation {0} not found")]
    NotFound(String),

    /// Allocation is owned by a workload.
    #[error("allocation {0} is assigned to a workload")]
    NotFree(String),

    /// Allocation belongs to a different node than expected.
    #[error("allocation {allocation_id} does not belong to node {node_id}")]
    WrongNode {
        allocation_id: String,
        node_id: String,
    },

    /// Primary allocations may only be released by workload deletion or a
    /// transfer's commit/rollback path, never as a standalone action.
    #[error("allocation {0} is the primary allocation of its workload")]
    PrimaryProtected(String),

    /// The owning workload does not exist.
    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    /// The workload has no node assignment to validate against.
    #[error("workload {0} has no node assigned")]
    WorkloadWithoutNode(String),

    /// Underlying database failure.
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// An allocation row.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub allocation_id: String,
    pub node_id: String,
    pub ip: String,
    pub port: i32,
    pub ip_alias: Option<String>,
    pub is_primary: bool,
    pub workload_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Allocation {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            allocation_id: row.try_get("allocation_id")?,
            node_id: row.try_get("node_id")?,
            // Comes back as TEXT since queries cast with host(ip)::TEXT
            ip: row.try_get("ip")?,
            port: row.try_get("port")?,
            ip_alias: row.try_get("ip_alias")?,
            is_primary: row.try_get("is_primary")?,
            workload_id: row.try_get("workload_id")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// An allocation row with derived ownership context for listings.
#[derive(Debug, Clone)]
pub struct ListedAllocation {
    pub allocation: Allocation,

    /// True when the owning workload sits in `install_failed`: the claim is
    /// intentionally retained for a retried provision, but operators need to
    /// tell it apart from a leak.
    pub held_by_failed_install: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ListedAllocation {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            allocation: Allocation::from_row(row)?,
            held_by_failed_install: row.try_get("held_by_failed_install")?,
        })
    }
}

/// Result of a bulk allocation create.
#[derive(Debug)]
pub struct BulkCreateOutcome {
    pub created: Vec<Allocation>,
    pub skipped: usize,
}

const SELECT_COLUMNS: &str = "allocation_id, node_id, host(ip)::TEXT as ip, port, ip_alias, \
                              is_primary, workload_id, notes, created_at, updated_at";

/// Store for allocation rows.
pub struct AllocationStore {
    pool: PgPool,
}

impl AllocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a free allocation for every `(ip, port)` pair that does not
    /// already exist on the node. Existing pairs are skipped, which makes
    /// the operation idempotent; it only fails when every pair conflicts.
    pub async fn bulk_create(
        &self,
        node_id: &str,
        ips: &[IpAddr],
        ports: &[u16],
        ip_alias: Option<&str>,
    ) -> Result<BulkCreateOutcome, AllocationError> {
        let mut created = Vec::new();
        let mut attempted = 0usize;

        let mut tx = self.pool.begin().await?;

        for ip in ips {
            for port in ports {
                attempted += 1;

                let inserted = sqlx::query_as::<_, Allocation>(&format!(
                    r#"
                    INSERT INTO allocations (allocation_id, node_id, ip, port, ip_alias)
                    VALUES ($1, $2, $3::INET, $4, $5)
                    ON CONFLICT (node_id, ip, port) DO NOTHING
                    RETURNING {SELECT_COLUMNS}
                    "#,
                ))
                .bind(AllocationId::new().to_string())
                .bind(node_id)
                .bind(ip.to_string())
                .bind(i32::from(*port))
                .bind(ip_alias)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(allocation) = inserted {
                    created.push(allocation);
                }
            }
        }

        if created.is_empty() && attempted > 0 {
            tx.rollback().await?;
            return Err(AllocationError::AllConflict);
        }

        tx.commit().await?;

        Ok(BulkCreateOutcome {
            skipped: attempted - created.len(),
            created,
        })
    }

    /// Fetch a single allocation.
    pub async fn get(&self, allocation_id: &str) -> Result<Option<Allocation>, AllocationError> {
        let row = sqlx::query_as::<_, Allocation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM allocations WHERE allocation_id = $1",
        ))
        .bind(allocation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// List a node's allocations, flagging claims held by failed installs.
    pub async fn list_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<ListedAllocation>, AllocationError> {
        let rows = sqlx::query_as::<_, ListedAllocation>(
            r#"
            SELECT a.allocation_id, a.node_id, host(a.ip)::TEXT as ip, a.port, a.ip_alias,
                   a.is_primary, a.workload_id, a.notes, a.created_at, a.updated_at,
                   COALESCE(w.status = 'install_failed', false) as held_by_failed_install
            FROM allocations a
            LEFT JOIN workloads w ON a.workload_id = w.workload_id
            WHERE a.node_id = $1
            ORDER BY a.ip, a.port
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Claim an allocation as a workload's primary allocation.
    ///
    /// Runs inside the caller's transaction: the target is row-locked and verified
    /// free (or already owned by this workload) and on the workload's node,
    /// the current primary is demoted, the target is claimed and promoted,
    /// and the workload's `primary_allocation_id` is updated. An observer
    /// never sees zero or two primaries.
    pub async fn assign_primary_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        allocation_id: &str,
    ) -> Result<Allocation, AllocationError> {
        let allocation = sqlx::query_as::<_, Allocation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM allocations WHERE allocation_id = $1 FOR UPDATE",
        ))
        .bind(allocation_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;

        if let Some(owner) = &allocation.workload_id {
            if owner != workload_id {
                return Err(AllocationError::NotFree(allocation_id.to_string()));
            }
        }

        let node_id: Option<Option<String>> =
            sqlx::query_scalar("SELECT node_id FROM workloads WHERE workload_id = $1 FOR UPDATE")
                .bind(workload_id)
                .fetch_optional(&mut **tx)
                .await?;

        let node_id = node_id
            .ok_or_else(|| AllocationError::WorkloadNotFound(workload_id.to_string()))?
            .ok_or_else(|| AllocationError::WorkloadWithoutNode(workload_id.to_string()))?;

        if allocation.node_id != node_id {
            return Err(AllocationError::WrongNode {
                allocation_id: allocation_id.to_string(),
                node_id,
            });
        }

        // Demote first: the partial unique index on (workload_id) WHERE
        // is_primary is checked per statement.
        sqlx::query(
            r#"
            UPDATE allocations
            SET is_primary = false, updated_at = now()
            WHERE workload_id = $1 AND is_primary AND allocation_id <> $2
            "#,
        )
        .bind(workload_id)
        .bind(allocation_id)
        .execute(&mut **tx)
        .await?;

        let claimed = sqlx::query_as::<_, Allocation>(&format!(
            r#"
            UPDATE allocations
            SET workload_id = $1, is_primary = true, updated_at = now()
            WHERE allocation_id = $2
            RETURNING {SELECT_COLUMNS}
            "#,
        ))
        .bind(workload_id)
        .bind(allocation_id)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE workloads SET primary_allocation_id = $1, updated_at = now() WHERE workload_id = $2",
        )
        .bind(allocation_id)
        .bind(workload_id)
        .execute(&mut **tx)
        .await?;

        Ok(claimed)
    }

    /// Release a non-primary allocation back to the free pool.
    pub async fn release(&self, allocation_id: &str) -> Result<(), AllocationError> {
        let mut tx = self.pool.begin().await?;

        let allocation = sqlx::query_as::<_, Allocation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM allocations WHERE allocation_id = $1 FOR UPDATE",
        ))
        .bind(allocation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;

        if allocation.is_primary {
            return Err(AllocationError::PrimaryProtected(allocation_id.to_string()));
        }

        sqlx::query(
            r#"
            UPDATE allocations
            SET workload_id = NULL, is_primary = false, updated_at = now()
            WHERE allocation_id = $1
            "#,
        )
        .bind(allocation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a free allocation. Owned allocations are refused.
    pub async fn delete(&self, allocation_id: &str) -> Result<(), AllocationError> {
        let mut tx = self.pool.begin().await?;

        let allocation = sqlx::query_as::<_, Allocation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM allocations WHERE allocation_id = $1 FOR UPDATE",
        ))
        .bind(allocation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;

        if allocation.workload_id.is_some() {
            return Err(AllocationError::NotFree(allocation_id.to_string()));
        }

        sqlx::query("DELETE FROM allocations WHERE allocation_id = $1")
            .bind(allocation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Release every allocation owned by a workload. Used by workload
    /// deletion, where the primary protection does not apply.
    pub async fn release_all_for_workload_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET workload_id = NULL, is_primary = false, updated_at = now()
            WHERE workload_id = $1
            "#,
        )
        .bind(workload_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Lock and return up to `limit` free allocations on the node for
    /// transfer-destination reservation. Allocations sharing `preferred_ip`
    /// sort first. Locked in one statement because rows already locked by
    /// this transaction would not be skipped on a second pass.
    pub async fn lock_free_batch_in(
        tx: &mut Transaction<'_, Postgres>,
        node_id: &str,
        preferred_ip: Option<&str>,
        exclude: &[String],
        limit: i64,
    ) -> Result<Vec<Allocation>, sqlx::Error> {
        sqlx::query_as::<_, Allocation>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM allocations
            WHERE node_id = $1 AND workload_id IS NULL AND allocation_id <> ALL($2)
            ORDER BY (CASE WHEN $3::TEXT IS NOT NULL AND host(ip) = $3 THEN 0 ELSE 1 END),
                     ip, port
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
        ))
        .bind(node_id)
        .bind(exclude)
        .bind(preferred_ip)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await
    }

    /// Lock a specific free allocation on the expected node.
    pub async fn lock_specific_free_in(
        tx: &mut Transaction<'_, Postgres>,
        node_id: &str,
        allocation_id: &str,
    ) -> Result<Option<Allocation>, sqlx::Error> {
        sqlx::query_as::<_, Allocation>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM allocations
            WHERE allocation_id = $1 AND node_id = $2 AND workload_id IS NULL
            FOR UPDATE
            "#,
        ))
        .bind(allocation_id)
        .bind(node_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Reserve a set of allocations for a workload without promoting any of
    /// them to primary. Used for transfer-destination reservation.
    pub async fn reserve_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        allocation_ids: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE allocations
            SET workload_id = $1, updated_at = now()
            WHERE allocation_id = ANY($2)
            "#,
        )
        .bind(workload_id)
        .bind(allocation_ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Release a specific set of allocations back to the free pool. Transfer
    /// commit/rollback path, where primary protection does not apply.
    pub async fn release_ids_in(
        tx: &mut Transaction<'_, Postgres>,
        allocation_ids: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE allocations
            SET workload_id = NULL, is_primary = false, updated_at = now()
            WHERE allocation_id = ANY($1)
            "#,
        )
        .bind(allocation_ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Re-assert a workload's ownership of a set of allocations, filtered
    /// to the expected node. Transfer commit path; the node filter keeps a
    /// stale snapshot from ever assigning an allocation on the wrong node.
    pub async fn assign_on_node_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        node_id: &str,
        allocation_ids: &[String],
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET workload_id = $1, updated_at = now()
            WHERE allocation_id = ANY($2) AND node_id = $3
            "#,
        )
        .bind(workload_id)
        .bind(allocation_ids)
        .bind(node_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Promote an allocation the workload already owns to primary. The
    /// caller must have released or demoted the previous primary first.
    pub async fn promote_primary_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        allocation_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE allocations
            SET is_primary = true, updated_at = now()
            WHERE allocation_id = $1 AND workload_id = $2
            "#,
        )
        .bind(allocation_id)
        .bind(workload_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Ids of the workload's non-primary allocations on the given node.
    pub async fn additional_ids_for_workload(
        &self,
        workload_id: &str,
        node_id: &str,
    ) -> Result<Vec<String>, AllocationError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT allocation_id FROM allocations
            WHERE workload_id = $1 AND node_id = $2 AND NOT is_primary
            ORDER BY allocation_id
            "#,
        )
        .bind(workload_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_conflict_message_names_no_ids() {
        let err = AllocationError::AllConflict;
        assert!(err.to_string().contains("every candidate"));
    }

    #[test]
    fn test_wrong_node_message() {
        let err = AllocationError::WrongNode {
            allocation_id: "alloc_X".into(),
            node_id: "node_Y".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alloc_X"));
        assert!(msg.contains("node_Y"));
    }
}
