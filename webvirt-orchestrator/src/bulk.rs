//! Batch provisioning of tenant accounts, one VM each.

use crate::credentials::{generate_password, normalize_name};
use crate::directory::{pick_unique_username, Directory, NewUser};
use crate::error::{OrchestratorError, Result};
use crate::ledger::{bulk_expiry_after, VmRecord};
use crate::orchestrator::{VmOrchestrator, VmSpec};
use crate::validation::{validate_duration, validate_resources};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, info, instrument};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PersonName {
    pub first_name: String,
    pub last_name: String,
}

/// A tenant ready to be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TenantCredentials {
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub tenants: Vec<TenantCredentials>,
    pub core_count: i64,
    pub memory: i64,
    /// Minutes, same unit as single creates. Unlike single creates, 0 keeps
    /// the VMs until they are deleted by hand.
    pub duration: i64,
    pub home_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub username: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub created: Vec<VmRecord>,
    pub failed: Option<BulkFailure>,
    /// Tenants never attempted because an earlier one failed.
    pub skipped: usize,
}

/// Normalized names, a username unique against the directory and the rest of
/// the batch, and a fresh password for every person.
pub async fn assign_credentials(
    directory: &dyn Directory,
    people: &[PersonName],
    password_length: usize,
) -> Result<Vec<TenantCredentials>> {
    let mut taken: HashSet<String> = directory
        .list_users()
        .await?
        .into_iter()
        .map(|u| u.username)
        .collect();

    let mut tenants = Vec::with_capacity(people.len());
    for person in people {
        let first_name = normalize_name(&person.first_name);
        let last_name = normalize_name(&person.last_name);
        if first_name.is_empty() || last_name.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "first and last name are required, got {:?} {:?}",
                person.first_name, person.last_name
            )));
        }

        let username = pick_unique_username(&first_name, &last_name, &taken);
        taken.insert(username.clone());

        tenants.push(TenantCredentials {
            first_name,
            last_name,
            username,
            password: generate_password(password_length)?,
        });
    }

    Ok(tenants)
}

pub struct BulkProvisioner {
    orchestrator: VmOrchestrator,
}

impl BulkProvisioner {
    pub fn new(orchestrator: VmOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Provisions tenants in order and stops at the first failure. VMs created
    /// before the failure stay in place.
    #[instrument(skip(self, request), fields(tenants = request.tenants.len()))]
    pub async fn run(&self, request: &BulkRequest) -> Result<BulkReport> {
        validate_resources(request.core_count, request.memory)?;
        validate_duration(request.duration)?;

        let mut report = BulkReport::default();

        for (index, tenant) in request.tenants.iter().enumerate() {
            match self.provision_tenant(tenant, request).await {
                Ok(record) => {
                    info!(username = %tenant.username, vmid = record.vmid, "Tenant provisioned");
                    report.created.push(record);
                }
                Err(e) => {
                    error!(username = %tenant.username, error = %e, "Bulk provisioning stopped");
                    report.failed = Some(BulkFailure {
                        username: tenant.username.clone(),
                        error: e.to_string(),
                    });
                    report.skipped = request.tenants.len() - index - 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn provision_tenant(
        &self,
        tenant: &TenantCredentials,
        request: &BulkRequest,
    ) -> Result<VmRecord> {
        let directory = self.orchestrator.directory();
        let uid_number = directory.next_free_uid().await?;

        directory
            .create_user(&NewUser {
                first_name: tenant.first_name.clone(),
                last_name: tenant.last_name.clone(),
                username: tenant.username.clone(),
                uid_number,
                password: tenant.password.clone(),
                home_prefix: request.home_prefix.clone(),
            })
            .await?;

        let spec = VmSpec {
            name: format!("{}-vm", tenant.username),
            core_count: request.core_count,
            memory: request.memory,
            duration: request.duration,
        };
        self.orchestrator
            .create_with_expiry(&tenant.username, &spec, bulk_expiry_after)
            .await
    }
}
