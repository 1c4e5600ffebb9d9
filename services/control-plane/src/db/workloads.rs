//! Workload and node stores.
//!
//! Workload `status` is a lifecycle marker, not a process state: NULL means
//! installed and healthy, `installing` means a provision is in flight,
//! `install_failed` and `transfer_failed` mark the corresponding operation's
//! failure. Runtime state lives on the node daemon and is never mirrored
//! here.

use chrono::{DateTime, Utc};
use gantry_id::WorkloadId;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::error::DbError;

/// Workload lifecycle status. Absent (`None` on the row) means installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadStatus {
    Installing,
    InstallFailed,
    TransferFailed,
}

impl WorkloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::InstallFailed => "install_failed",
            Self::TransferFailed => "transfer_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "installing" => Some(Self::Installing),
            "install_failed" => Some(Self::InstallFailed),
            "transfer_failed" => Some(Self::TransferFailed),
            _ => None,
        }
    }
}

/// A workload row.
#[derive(Debug, Clone)]
pub struct Workload {
    pub workload_id: String,
    pub uuid: Uuid,
    pub name: String,
    pub node_id: Option<String>,
    pub primary_allocation_id: Option<String>,
    pub status: Option<WorkloadStatus>,
    pub owner_id: String,
    pub image_ref: String,
    pub start_on_completion: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Workload {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let status: Option<String> = row.try_get("status")?;

        Ok(Self {
            workload_id: row.try_get("workload_id")?,
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            node_id: row.try_get("node_id")?,
            primary_allocation_id: row.try_get("primary_allocation_id")?,
            status: status.as_deref().and_then(WorkloadStatus::parse),
            owner_id: row.try_get("owner_id")?,
            image_ref: row.try_get("image_ref")?,
            start_on_completion: row.try_get("start_on_completion")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input for creating a workload row.
#[derive(Debug)]
pub struct NewWorkload {
    pub name: String,
    pub node_id: String,
    pub owner_id: String,
    pub image_ref: String,
    pub start_on_completion: bool,
}

/// A node row. The daemon token is stored in the clear because the control
/// plane must present it verbatim on outbound daemon calls.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub name: String,
    pub fqdn: String,
    pub scheme: String,
    pub daemon_port: i32,
    pub daemon_token_id: String,
    pub daemon_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for NodeRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            node_id: row.try_get("node_id")?,
            name: row.try_get("name")?,
            fqdn: row.try_get("fqdn")?,
            scheme: row.try_get("scheme")?,
            daemon_port: row.try_get("daemon_port")?,
            daemon_token_id: row.try_get("daemon_token_id")?,
            daemon_token: row.try_get("daemon_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const WORKLOAD_COLUMNS: &str = "workload_id, uuid, name, node_id, primary_allocation_id, status, \
                                owner_id, image_ref, start_on_completion, created_at, updated_at";

const NODE_COLUMNS: &str = "node_id, name, fqdn, scheme, daemon_port, daemon_token_id, \
                            daemon_token, created_at, updated_at";

/// Store for workload and node rows.
pub struct WorkloadStore {
    pool: PgPool,
}

impl WorkloadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new workload row in `installing`, inside the caller's
    /// transaction so creation and the first allocation claim commit or
    /// vanish together.
    pub async fn create_in(
        tx: &mut Transaction<'_, Postgres>,
        input: NewWorkload,
    ) -> Result<Workload, sqlx::Error> {
        sqlx::query_as::<_, Workload>(&format!(
            r#"
            INSERT INTO workloads
                (workload_id, uuid, name, node_id, status, owner_id, image_ref,
                 start_on_completion)
            VALUES ($1, $2, $3, $4, 'installing', $5, $6, $7)
            RETURNING {WORKLOAD_COLUMNS}
            "#,
        ))
        .bind(WorkloadId::new().to_string())
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.node_id)
        .bind(&input.owner_id)
        .bind(&input.image_ref)
        .bind(input.start_on_completion)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn get(&self, workload_id: &str) -> Result<Option<Workload>, DbError> {
        sqlx::query_as::<_, Workload>(&format!(
            "SELECT {WORKLOAD_COLUMNS} FROM workloads WHERE workload_id = $1",
        ))
        .bind(workload_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Workload>, DbError> {
        sqlx::query_as::<_, Workload>(&format!(
            "SELECT {WORKLOAD_COLUMNS} FROM workloads WHERE uuid = $1",
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list(&self) -> Result<Vec<Workload>, DbError> {
        sqlx::query_as::<_, Workload>(&format!(
            "SELECT {WORKLOAD_COLUMNS} FROM workloads ORDER BY created_at",
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn set_status(
        &self,
        workload_id: &str,
        status: Option<WorkloadStatus>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE workloads SET status = $1, updated_at = now() WHERE workload_id = $2")
            .bind(status.map(WorkloadStatus::as_str))
            .bind(workload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(())
    }

    pub async fn set_status_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        status: Option<WorkloadStatus>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE workloads SET status = $1, updated_at = now() WHERE workload_id = $2")
            .bind(status.map(WorkloadStatus::as_str))
            .bind(workload_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Move a workload to a new node and primary allocation. Transfer commit
    /// path; runs inside the caller's transaction.
    pub async fn relocate_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
        node_id: &str,
        primary_allocation_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workloads
            SET node_id = $1, primary_allocation_id = $2, updated_at = now()
            WHERE workload_id = $3
            "#,
        )
        .bind(node_id)
        .bind(primary_allocation_id)
        .bind(workload_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Whether the workload has an in-flight transfer.
    pub async fn is_transferring(&self, workload_id: &str) -> Result<bool, DbError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM transfers WHERE workload_id = $1 AND NOT archived)",
        )
        .bind(workload_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn delete_in(
        tx: &mut Transaction<'_, Postgres>,
        workload_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM workloads WHERE workload_id = $1")
            .bind(workload_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    // Node queries live here rather than in a store of their own: the
    // control plane only ever reads nodes as routing + auth material for
    // workload operations.

    pub async fn create_node(
        &self,
        node_id: &str,
        name: &str,
        fqdn: &str,
        scheme: &str,
        daemon_port: i32,
        daemon_token_id: &str,
        daemon_token: &str,
    ) -> Result<NodeRecord, DbError> {
        sqlx::query_as::<_, NodeRecord>(&format!(
            r#"
            INSERT INTO nodes
                (node_id, name, fqdn, scheme, daemon_port, daemon_token_id, daemon_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {NODE_COLUMNS}
            "#,
        ))
        .bind(node_id)
        .bind(name)
        .bind(fqdn)
        .bind(scheme)
        .bind(daemon_port)
        .bind(daemon_token_id)
        .bind(daemon_token)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, DbError> {
        sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = $1",
        ))
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn get_node_by_token_id(
        &self,
        daemon_token_id: &str,
    ) -> Result<Option<NodeRecord>, DbError> {
        sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE daemon_token_id = $1",
        ))
        .bind(daemon_token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, DbError> {
        sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY created_at",
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            WorkloadStatus::Installing,
            WorkloadStatus::InstallFailed,
            WorkloadStatus::TransferFailed,
        ] {
            assert_eq!(WorkloadStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_status_rejects_unknown() {
        assert_eq!(WorkloadStatus::parse("running"), None);
        assert_eq!(WorkloadStatus::parse(""), None);
    }
}
