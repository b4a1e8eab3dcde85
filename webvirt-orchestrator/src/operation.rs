//! Audit journal of workflow runs.
//!
//! One row per create, update, delete or reclaim, including failed ones, so an
//! operator can find remote state a failed workflow or compensation left behind.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    pub id: String,
    pub vm_name: String,
    pub vmid: Option<u32>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Reclaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
    /// Refused because the VM was running.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct NewOperation<'a> {
    pub vm_name: &'a str,
    pub vmid: Option<u32>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    pool: SqlitePool,
}

impl Journal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a finished workflow run
    pub async fn record(&self, op: NewOperation<'_>) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO operations (id, vm_name, vmid, operation_type, status, started_at, completed_at, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(op.vm_name)
        .bind(op.vmid)
        .bind(op.operation_type)
        .bind(op.status)
        .bind(op.started_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(op.error)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Operations, newest first, optionally narrowed to one VM name
    pub async fn list(&self, vm_name: Option<&str>) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if vm_name.is_some() {
            query.push_str(" AND vm_name = ?");
        }

        query.push_str(" ORDER BY started_at DESC, completed_at DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(name) = vm_name {
            q = q.bind(name);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    vm_name: String,
    vmid: Option<u32>,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            vm_name: row.vm_name,
            vmid: row.vmid,
            operation_type: row.operation_type,
            status: row.status,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            error: row.error,
        }
    }
}
