use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;

/// One provisioned VM and who owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VmRecord {
    pub id: i64,
    /// Hypervisor VM id.
    pub vmid: u32,
    pub name: String,
    pub core_count: i64,
    /// Memory in MiB.
    pub memory: i64,
    /// VNC display number; the console listens on 5900 + port.
    pub port: u16,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    /// `None` means the VM never expires.
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewVmRecord {
    pub vmid: u32,
    pub name: String,
    pub core_count: i64,
    pub memory: i64,
    pub port: u16,
    pub owner: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Expiry `duration_minutes` after `now`. Zero expires right away, so the
/// next reaper cycle reclaims the VM.
pub fn expiry_after(duration_minutes: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Past the representable range is as good as never.
    Duration::try_minutes(duration_minutes.max(0)).and_then(|d| now.checked_add_signed(d))
}

/// Expiry for VMs provisioned by a bulk import, where zero or less keeps the
/// VMs until someone deletes them.
pub fn bulk_expiry_after(duration_minutes: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if duration_minutes <= 0 {
        return None;
    }
    expiry_after(duration_minutes, now)
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, record: &NewVmRecord) -> Result<VmRecord> {
        let created_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO virtual_machines (vmid, name, core_count, memory, port, owner, created_at, expiry)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.vmid)
        .bind(&record.name)
        .bind(record.core_count)
        .bind(record.memory)
        .bind(record.port)
        .bind(&record.owner)
        .bind(created_at.timestamp())
        .bind(record.expiry.map(|dt| dt.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(VmRecord {
            id: result.last_insert_rowid(),
            vmid: record.vmid,
            name: record.name.clone(),
            core_count: record.core_count,
            memory: record.memory,
            port: record.port,
            owner: record.owner.clone(),
            created_at: truncate_to_seconds(created_at),
            expiry: record.expiry.map(truncate_to_seconds),
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<VmRecord>> {
        let row = sqlx::query_as::<_, VmRow>("SELECT * FROM virtual_machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// The record with `id`, provided `owner` owns it.
    pub async fn find_owned(&self, id: i64, owner: &str) -> Result<Option<VmRecord>> {
        let row = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE id = ? AND owner = ?",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<VmRecord>> {
        let rows = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE owner = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Records whose expiry is at or before `now`.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<VmRecord>> {
        let rows = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE expiry IS NOT NULL AND expiry <= ? ORDER BY expiry",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Returns false when no record has `id`.
    pub async fn update_specs(&self, id: i64, core_count: i64, memory: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE virtual_machines SET core_count = ?, memory = ? WHERE id = ?")
                .bind(core_count)
                .bind(memory)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns false when no record has `id`.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

#[derive(sqlx::FromRow)]
struct VmRow {
    id: i64,
    vmid: u32,
    name: String,
    core_count: i64,
    memory: i64,
    port: u16,
    owner: String,
    created_at: i64,
    expiry: Option<i64>,
}

impl From<VmRow> for VmRecord {
    fn from(row: VmRow) -> Self {
        Self {
            id: row.id,
            vmid: row.vmid,
            name: row.name,
            core_count: row.core_count,
            memory: row.memory,
            port: row.port,
            owner: row.owner,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            expiry: row.expiry.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}
